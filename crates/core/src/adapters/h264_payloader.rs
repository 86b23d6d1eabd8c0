//! RFC 6184 single-NAL and FU-A packetization of an Annex B H.264 access
//! unit into `webrtc` RTP packets. Deliberately minimal: no STAP-A
//! aggregation, no interleaved mode. Good enough for a reference encoded
//! pipeline and for tests; a production deployment should reach for a
//! hardened payloader instead.

use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

const RTP_HEADER_BYTES: usize = 12;
const FU_HEADER_BYTES: usize = 2;

pub struct H264Payloader {
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
}

impl H264Payloader {
    pub fn new(mtu: usize, payload_type: u8, ssrc: u32) -> Self {
        Self {
            mtu: mtu.max(RTP_HEADER_BYTES + FU_HEADER_BYTES + 1),
            payload_type,
            ssrc,
            sequence_number: 0,
        }
    }

    /// Packetize one Annex B access unit (possibly several NAL units, e.g.
    /// SPS + PPS + slice on a keyframe) at the given RTP timestamp.
    pub fn packetize(&mut self, access_unit: &[u8], timestamp: u32) -> Vec<Packet> {
        let nal_units = split_annex_b(access_unit);
        let mut packets = Vec::new();
        let last_index = nal_units.len().saturating_sub(1);

        for (i, nal) in nal_units.into_iter().enumerate() {
            let is_last_nal = i == last_index;
            if nal.len() <= self.mtu - RTP_HEADER_BYTES {
                packets.push(self.single_nal_packet(nal, timestamp, is_last_nal));
            } else {
                packets.extend(self.fragment_nal(nal, timestamp, is_last_nal));
            }
        }
        packets
    }

    fn next_header(&mut self, timestamp: u32, marker: bool) -> Header {
        let header = Header {
            version: 2,
            padding: false,
            extension: false,
            marker,
            payload_type: self.payload_type,
            sequence_number: self.sequence_number,
            timestamp,
            ssrc: self.ssrc,
            ..Default::default()
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        header
    }

    fn single_nal_packet(&mut self, nal: &[u8], timestamp: u32, marker: bool) -> Packet {
        Packet {
            header: self.next_header(timestamp, marker),
            payload: nal.to_vec().into(),
        }
    }

    fn fragment_nal(&mut self, nal: &[u8], timestamp: u32, nal_is_last: bool) -> Vec<Packet> {
        if nal.is_empty() {
            return Vec::new();
        }
        let nal_header = nal[0];
        let nal_type = nal_header & 0x1F;
        let fu_indicator = (nal_header & 0xE0) | 28; // FU-A

        let chunk_size = self.mtu - RTP_HEADER_BYTES - FU_HEADER_BYTES;
        let body = &nal[1..];
        let mut packets = Vec::new();
        let mut offset = 0;

        while offset < body.len() {
            let end = (offset + chunk_size).min(body.len());
            let is_first = offset == 0;
            let is_last = end == body.len();

            let mut fu_header = 0u8;
            if is_first {
                fu_header |= 0x80;
            }
            if is_last {
                fu_header |= 0x40;
            }
            fu_header |= nal_type;

            let mut payload = Vec::with_capacity(2 + (end - offset));
            payload.push(fu_indicator);
            payload.push(fu_header);
            payload.extend_from_slice(&body[offset..end]);

            let marker = is_last && nal_is_last;
            packets.push(Packet {
                header: self.next_header(timestamp, marker),
                payload: payload.into(),
            });
            offset = end;
        }
        packets
    }
}

/// Splits an Annex B bitstream (0x000001 or 0x00000001 start codes) into
/// its constituent NAL units, stripped of start codes.
fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_len = if i > 0 && data[i - 1] == 0 { 4 } else { 3 };
            starts.push((i + 3, code_len));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nal_units = Vec::with_capacity(starts.len());
    for (idx, &(nal_start, _)) in starts.iter().enumerate() {
        let nal_end = starts
            .get(idx + 1)
            .map(|&(next_start, next_code_len)| next_start - next_code_len - 1)
            .unwrap_or(data.len());
        if nal_end > nal_start {
            nal_units.push(&data[nal_start..nal_end]);
        }
    }
    nal_units
}
