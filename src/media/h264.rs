//! H.264/AVC configuration records and NAL unit framing
//!
//! Encoders and decoders exchange Annex-B (start-code delimited) NAL units;
//! RTMP carries AVCC (length-prefixed) NAL units and an
//! AVCDecoderConfigurationRecord in the sequence header:
//!
//! ```text
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
//! | AVCLevelIndication (1) | lengthSizeMinusOne (1, lower 2 bits)
//! | numOfSPS (1, lower 5 bits) | { spsLength (2) | spsNALUnit }*
//! | numOfPPS (1) | { ppsLength (2) | ppsNALUnit }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// Four-byte Annex-B start code
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    Slice = 1,
    SlicePartA = 2,
    SlicePartB = 3,
    SlicePartC = 4,
    /// IDR slice (keyframe)
    Idr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    Aud = 9,
    EndSeq = 10,
    EndStream = 11,
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }
}

/// AVCDecoderConfigurationRecord
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    /// 66 = Baseline, 77 = Main, 100 = High, ...
    pub profile: u8,
    pub compatibility: u8,
    /// e.g. 31 = 3.1
    pub level: u8,
    /// Bytes per NAL length prefix, usually 4
    pub nalu_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Collect SPS/PPS from start-coded codec configuration data
    pub fn from_annex_b(data: &[u8]) -> Result<Self> {
        let mut sps = Vec::new();
        let mut pps = Vec::new();
        for nalu in AnnexBIterator::new(data) {
            match NaluType::from_byte(nalu[0]) {
                Some(NaluType::Sps) => sps.push(Bytes::copy_from_slice(nalu)),
                Some(NaluType::Pps) => pps.push(Bytes::copy_from_slice(nalu)),
                _ => {}
            }
        }

        let first = sps.first().ok_or(MediaError::InvalidAvcPacket)?;
        if first.len() < 4 {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        Ok(Self {
            profile: first[1],
            compatibility: first[2],
            level: first[3],
            nalu_length_size: 4,
            sps,
            pps,
        })
    }

    /// Parse an AVCDecoderConfigurationRecord
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < 7 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let version = data.get_u8();
        if version != 1 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let sps = read_parameter_sets(&mut data, num_sps)?;

        if data.is_empty() {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let num_pps = data.get_u8() as usize;
        let pps = read_parameter_sets(&mut data, num_pps)?;

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
        })
    }

    /// Serialize as an AVCDecoderConfigurationRecord
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(1);
        buf.put_u8(self.profile);
        buf.put_u8(self.compatibility);
        buf.put_u8(self.level);
        buf.put_u8(0xFC | (self.nalu_length_size.saturating_sub(1) & 0x03));
        buf.put_u8(0xE0 | (self.sps.len() as u8 & 0x1F));
        for sps in &self.sps {
            buf.put_u16(sps.len() as u16);
            buf.put_slice(sps);
        }
        buf.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            buf.put_u16(pps.len() as u16);
            buf.put_slice(pps);
        }
    }

    /// Start-coded SPS followed by PPS, as decoders take them
    pub fn to_csd(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for nalu in self.sps.iter().chain(&self.pps) {
            buf.put_slice(&START_CODE);
            buf.put_slice(nalu);
        }
        buf.freeze()
    }

    pub fn profile_name(&self) -> &'static str {
        match self.profile {
            66 => "Baseline",
            77 => "Main",
            88 => "Extended",
            100 => "High",
            110 => "High 10",
            122 => "High 4:2:2",
            244 => "High 4:4:4",
            _ => "Unknown",
        }
    }

    pub fn level_string(&self) -> String {
        format!("{}.{}", self.level / 10, self.level % 10)
    }
}

fn read_parameter_sets(data: &mut Bytes, count: usize) -> Result<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < 2 {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let len = data.get_u16() as usize;
        if data.len() < len {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        sets.push(data.copy_to_bytes(len));
    }
    Ok(sets)
}

/// Iterator over NAL units in AVCC format
pub struct NaluIterator<'a> {
    data: &'a [u8],
    offset: usize,
    nalu_length_size: usize,
}

impl<'a> NaluIterator<'a> {
    pub fn new(data: &'a [u8], nalu_length_size: u8) -> Self {
        Self {
            data,
            offset: 0,
            nalu_length_size: nalu_length_size as usize,
        }
    }
}

impl<'a> Iterator for NaluIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + self.nalu_length_size > self.data.len() {
            return None;
        }

        let mut len: usize = 0;
        for i in 0..self.nalu_length_size {
            len = (len << 8) | (self.data[self.offset + i] as usize);
        }
        self.offset += self.nalu_length_size;

        if self.offset + len > self.data.len() {
            return None;
        }

        let nalu = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some(nalu)
    }
}

/// Iterator over NAL units separated by 3- or 4-byte start codes
pub struct AnnexBIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> AnnexBIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let offset = find_start_code(data, 0).map_or(data.len(), |(_, end)| end);
        Self { data, offset }
    }
}

impl<'a> Iterator for AnnexBIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset < self.data.len() {
            let start = self.offset;
            let (end, next) = find_start_code(self.data, start)
                .unwrap_or((self.data.len(), self.data.len()));
            self.offset = next;
            if end > start {
                return Some(&self.data[start..end]);
            }
        }
        None
    }
}

/// Position of the next start code at or after `from` as `(start, end)`
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, i + 3));
            }
            if data[i + 2] == 0 && i + 4 <= data.len() && data[i + 3] == 1 {
                return Some((i, i + 4));
            }
        }
        i += 1;
    }
    None
}

/// Rewrite start-coded NAL units with 4-byte length prefixes
pub fn annex_b_to_avcc(data: &[u8], buf: &mut BytesMut) {
    for nalu in AnnexBIterator::new(data) {
        buf.put_u32(nalu.len() as u32);
        buf.put_slice(nalu);
    }
}

/// Rewrite length-prefixed NAL units with 4-byte start codes
pub fn avcc_to_annex_b(data: &[u8], nalu_length_size: u8, buf: &mut BytesMut) {
    for nalu in NaluIterator::new(data, nalu_length_size) {
        buf.put_slice(&START_CODE);
        buf.put_slice(nalu);
    }
}

/// True if start-coded data carries an IDR slice
pub fn contains_idr(data: &[u8]) -> bool {
    AnnexBIterator::new(data).any(|nalu| NaluType::from_byte(nalu[0]) == Some(NaluType::Idr))
}
