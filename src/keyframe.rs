//! Keyframe detection on RTP payloads
//!
//! Simulcast layer switches are only safe at keyframe boundaries, so the
//! forwarding path needs a cheap per-packet answer to "does this packet
//! start a decodable frame?". Only the two codecs the SFU negotiates are
//! inspected; anything else is never a keyframe.

use webrtc::rtp::packet::Packet;

const H264_NAL_TYPE_IDR: u8 = 5;
const H264_NAL_TYPE_SPS: u8 = 7;
const H264_NAL_TYPE_STAP_A: u8 = 24;
const H264_NAL_TYPE_FU_A: u8 = 28;

/// Returns whether `packet` carries (part of) a keyframe for `mime_type`.
#[must_use]
pub fn is_keyframe(mime_type: &str, packet: &Packet) -> bool {
    let mime = mime_type.to_ascii_lowercase();
    match mime.as_str() {
        "video/h264" => is_h264_keyframe(&packet.payload),
        "video/vp8" => is_vp8_keyframe(&packet.payload),
        _ => false,
    }
}

fn is_h264_keyframe(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };

    match first & 0x1F {
        H264_NAL_TYPE_IDR | H264_NAL_TYPE_SPS => true,
        H264_NAL_TYPE_STAP_A => {
            // Aggregation packet: walk the 2-byte-length prefixed NAL units.
            let mut offset = 1;
            while offset + 2 < payload.len() {
                let size = usize::from(u16::from_be_bytes([payload[offset], payload[offset + 1]]));
                offset += 2;
                if offset >= payload.len() {
                    break;
                }
                let nal_type = payload[offset] & 0x1F;
                if nal_type == H264_NAL_TYPE_IDR || nal_type == H264_NAL_TYPE_SPS {
                    return true;
                }
                offset += size;
            }
            false
        }
        H264_NAL_TYPE_FU_A => {
            // Fragmentation unit: only the fragment with the start bit can
            // begin a keyframe.
            payload.len() >= 2
                && payload[1] & 0x80 != 0
                && payload[1] & 0x1F == H264_NAL_TYPE_IDR
        }
        _ => false,
    }
}

fn is_vp8_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }

    let descriptor = payload[0];
    let start_of_partition = descriptor & 0x10 != 0;
    let partition_index = descriptor & 0x07;
    if !start_of_partition || partition_index != 0 {
        return false;
    }

    // Skip the variable-length payload descriptor.
    let mut offset = 1;
    if descriptor & 0x80 != 0 {
        // X bit set: one extension byte follows.
        if payload.len() <= offset {
            return false;
        }
        let extension = payload[offset];
        offset += 1;
        if extension & 0x80 != 0 {
            // I bit: picture ID, one or two bytes.
            if payload.len() <= offset {
                return false;
            }
            offset += if payload[offset] & 0x80 != 0 { 2 } else { 1 };
        }
        if extension & 0x40 != 0 {
            // L bit: TL0PICIDX.
            offset += 1;
        }
        if extension & 0x30 != 0 {
            // T or K bit: TID/KEYIDX byte.
            offset += 1;
        }
    }

    // P bit of the VP8 payload header: 0 means keyframe.
    payload.get(offset).is_some_and(|b| b & 0x01 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet_with(payload: Vec<u8>) -> Packet {
        Packet {
            payload: Bytes::from(payload),
            ..Default::default()
        }
    }

    #[test]
    fn h264_idr_is_keyframe() {
        let packet = packet_with(vec![0x65, 0x88, 0x84]);
        assert!(is_keyframe("video/H264", &packet));
    }

    #[test]
    fn h264_sps_is_keyframe() {
        let packet = packet_with(vec![0x67, 0x42, 0x00]);
        assert!(is_keyframe("video/H264", &packet));
    }

    #[test]
    fn h264_non_idr_slice_is_not_keyframe() {
        let packet = packet_with(vec![0x61, 0xe0, 0x20]);
        assert!(!is_keyframe("video/H264", &packet));
    }

    #[test]
    fn h264_stap_a_containing_sps() {
        // STAP-A header, then a 4-byte SPS NAL behind a length prefix.
        let packet = packet_with(vec![0x78, 0x00, 0x04, 0x67, 0x42, 0x00, 0x1f]);
        assert!(is_keyframe("video/H264", &packet));
    }

    #[test]
    fn h264_fu_a_start_of_idr() {
        // FU indicator (type 28), FU header with start bit + IDR type.
        let packet = packet_with(vec![0x7c, 0x85, 0x88]);
        assert!(is_keyframe("video/H264", &packet));
        // Continuation fragment of the same NAL: no start bit.
        let packet = packet_with(vec![0x7c, 0x05, 0x88]);
        assert!(!is_keyframe("video/H264", &packet));
    }

    #[test]
    fn vp8_keyframe_with_plain_descriptor() {
        // S bit set, PID 0, no extension; payload header P bit clear.
        let packet = packet_with(vec![0x10, 0x00, 0x9d, 0x01, 0x2a]);
        assert!(is_keyframe("video/VP8", &packet));
    }

    #[test]
    fn vp8_interframe_is_not_keyframe() {
        // Same descriptor, P bit set in the payload header.
        let packet = packet_with(vec![0x10, 0x01, 0x9d, 0x01, 0x2a]);
        assert!(!is_keyframe("video/VP8", &packet));
    }

    #[test]
    fn vp8_extended_descriptor_with_two_byte_picture_id() {
        // X set, S set; extension byte with I set; 15-bit picture ID.
        let packet = packet_with(vec![0x90, 0x80, 0x81, 0x23, 0x00, 0x9d]);
        assert!(is_keyframe("video/VP8", &packet));
    }

    #[test]
    fn vp8_non_start_packet_is_not_keyframe() {
        let packet = packet_with(vec![0x00, 0x00, 0x9d]);
        assert!(!is_keyframe("video/VP8", &packet));
    }

    #[test]
    fn audio_is_never_a_keyframe() {
        let packet = packet_with(vec![0x65]);
        assert!(!is_keyframe("audio/opus", &packet));
    }

    #[test]
    fn empty_payload() {
        let packet = packet_with(vec![]);
        assert!(!is_keyframe("video/H264", &packet));
        assert!(!is_keyframe("video/VP8", &packet));
    }
}
