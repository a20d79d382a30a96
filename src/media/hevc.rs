//! HEVCDecoderConfigurationRecord (ISO/IEC 14496-15 8.3.3.1.2)
//!
//! ```text
//! configurationVersion (8)
//! general_profile_space (2) | general_tier_flag (1) | general_profile_idc (5)
//! general_profile_compatibility_flags (32)
//! general_constraint_indicator_flags (48)
//! general_level_idc (8)
//! reserved '1111' (4) | min_spatial_segmentation_idc (12)
//! reserved '111111' (6) | parallelismType (2)
//! reserved '111111' (6) | chromaFormat (2)
//! reserved '11111' (5) | bitDepthLumaMinus8 (3)
//! reserved '11111' (5) | bitDepthChromaMinus8 (3)
//! avgFrameRate (16)
//! constantFrameRate (2) | numTemporalLayers (3) | temporalIdNested (1) | lengthSizeMinusOne (2)
//! numOfArrays (8)
//! { array_completeness (1) | reserved (1) | NAL_unit_type (6) | numNalus (16)
//!   { nalUnitLength (16) | nalUnit }* }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};
use crate::media::h264::{AnnexBIterator, START_CODE};

pub const NAL_UNIT_TYPE_VPS: u8 = 32;
pub const NAL_UNIT_TYPE_SPS: u8 = 33;
pub const NAL_UNIT_TYPE_PPS: u8 = 34;

const MIN_RECORD_LEN: usize = 23;

/// HEVC NAL unit type from the first header byte
pub fn nal_unit_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// IRAP pictures (BLA, IDR, CRA) are random access points
pub fn is_irap(header: u8) -> bool {
    (16..=23).contains(&nal_unit_type(header))
}

/// One `NAL_unit_type` array of the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalArray {
    pub array_completeness: bool,
    pub nal_unit_type: u8,
    /// Complete NAL units including their two-byte header
    pub units: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcConfig {
    pub configuration_version: u8,
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    /// 48 bits
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    pub length_size_minus_one: u8,
    pub arrays: Vec<NalArray>,
}

impl HevcConfig {
    /// Build a record from start-coded VPS/SPS/PPS
    pub fn from_annex_b(data: &[u8]) -> Result<Self> {
        let mut arrays: Vec<NalArray> = [NAL_UNIT_TYPE_VPS, NAL_UNIT_TYPE_SPS, NAL_UNIT_TYPE_PPS]
            .into_iter()
            .map(|nal_unit_type| NalArray {
                array_completeness: false,
                nal_unit_type,
                units: Vec::new(),
            })
            .collect();

        for nalu in AnnexBIterator::new(data) {
            let unit_type = nal_unit_type(nalu[0]);
            if let Some(array) = arrays.iter_mut().find(|a| a.nal_unit_type == unit_type) {
                array.units.push(Bytes::copy_from_slice(nalu));
            }
        }

        let sps = arrays[1]
            .units
            .first()
            .ok_or(MediaError::InvalidHevcRecord)?;
        let sps = HevcSps::parse(sps)?;
        arrays.retain(|a| !a.units.is_empty());

        Ok(Self {
            configuration_version: 1,
            general_profile_space: sps.general_profile_space,
            general_tier_flag: sps.general_tier_flag,
            general_profile_idc: sps.general_profile_idc,
            general_profile_compatibility_flags: sps.general_profile_compatibility_flags,
            general_constraint_indicator_flags: sps.general_constraint_indicator_flags,
            general_level_idc: sps.general_level_idc,
            min_spatial_segmentation_idc: 0,
            parallelism_type: 0,
            chroma_format: sps.chroma_format_idc,
            bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
            avg_frame_rate: 0,
            constant_frame_rate: 0,
            num_temporal_layers: sps.max_sub_layers,
            temporal_id_nested: sps.temporal_id_nesting,
            length_size_minus_one: 3,
            arrays,
        })
    }

    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < MIN_RECORD_LEN {
            return Err(MediaError::InvalidHevcRecord.into());
        }

        let configuration_version = data.get_u8();
        let b = data.get_u8();
        let general_profile_compatibility_flags = data.get_u32();
        let general_constraint_indicator_flags = data.get_uint(6);
        let general_level_idc = data.get_u8();
        let min_spatial_segmentation_idc = data.get_u16() & 0x0FFF;
        let parallelism_type = data.get_u8() & 0x03;
        let chroma_format = data.get_u8() & 0x03;
        let bit_depth_luma_minus8 = data.get_u8() & 0x07;
        let bit_depth_chroma_minus8 = data.get_u8() & 0x07;
        let avg_frame_rate = data.get_u16();
        let t = data.get_u8();
        let num_arrays = data.get_u8();

        let mut arrays = Vec::with_capacity(num_arrays as usize);
        for _ in 0..num_arrays {
            if data.len() < 3 {
                return Err(MediaError::InvalidHevcRecord.into());
            }
            let header = data.get_u8();
            let num_nalus = data.get_u16();
            let mut units = Vec::with_capacity(num_nalus as usize);
            for _ in 0..num_nalus {
                if data.len() < 2 {
                    return Err(MediaError::InvalidHevcRecord.into());
                }
                let len = data.get_u16() as usize;
                if data.len() < len {
                    return Err(MediaError::InvalidHevcRecord.into());
                }
                units.push(data.copy_to_bytes(len));
            }
            arrays.push(NalArray {
                array_completeness: header & 0x80 != 0,
                nal_unit_type: header & 0x3F,
                units,
            });
        }

        Ok(Self {
            configuration_version,
            general_profile_space: b >> 6,
            general_tier_flag: b & 0x20 != 0,
            general_profile_idc: b & 0x1F,
            general_profile_compatibility_flags,
            general_constraint_indicator_flags,
            general_level_idc,
            min_spatial_segmentation_idc,
            parallelism_type,
            chroma_format,
            bit_depth_luma_minus8,
            bit_depth_chroma_minus8,
            avg_frame_rate,
            constant_frame_rate: t >> 6,
            num_temporal_layers: (t >> 3) & 0x07,
            temporal_id_nested: t & 0x04 != 0,
            length_size_minus_one: t & 0x03,
            arrays,
        })
    }

    /// Serialized length in bytes
    pub fn encoded_len(&self) -> usize {
        MIN_RECORD_LEN
            + self
                .arrays
                .iter()
                .map(|a| 3 + a.units.iter().map(|u| 2 + u.len()).sum::<usize>())
                .sum::<usize>()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.configuration_version);
        buf.put_u8(
            ((self.general_profile_space & 0x03) << 6)
                | if self.general_tier_flag { 0x20 } else { 0 }
                | (self.general_profile_idc & 0x1F),
        );
        buf.put_u32(self.general_profile_compatibility_flags);
        buf.put_uint(self.general_constraint_indicator_flags & 0xFFFF_FFFF_FFFF, 6);
        buf.put_u8(self.general_level_idc);
        buf.put_u16(0xF000 | (self.min_spatial_segmentation_idc & 0x0FFF));
        buf.put_u8(0xFC | (self.parallelism_type & 0x03));
        buf.put_u8(0xFC | (self.chroma_format & 0x03));
        buf.put_u8(0xF8 | (self.bit_depth_luma_minus8 & 0x07));
        buf.put_u8(0xF8 | (self.bit_depth_chroma_minus8 & 0x07));
        buf.put_u16(self.avg_frame_rate);
        buf.put_u8(
            ((self.constant_frame_rate & 0x03) << 6)
                | ((self.num_temporal_layers & 0x07) << 3)
                | if self.temporal_id_nested { 0x04 } else { 0 }
                | (self.length_size_minus_one & 0x03),
        );
        buf.put_u8(self.arrays.len() as u8);
        for array in &self.arrays {
            buf.put_u8(
                if array.array_completeness { 0x80 } else { 0 } | (array.nal_unit_type & 0x3F),
            );
            buf.put_u16(array.units.len() as u16);
            for unit in &array.units {
                buf.put_u16(unit.len() as u16);
                buf.put_slice(unit);
            }
        }
    }

    pub fn nalu_length_size(&self) -> u8 {
        self.length_size_minus_one + 1
    }

    pub fn units(&self, nal_unit_type: u8) -> impl Iterator<Item = &Bytes> {
        self.arrays
            .iter()
            .filter(move |a| a.nal_unit_type == nal_unit_type)
            .flat_map(|a| a.units.iter())
    }

    /// Start-coded parameter sets, as decoders take them
    pub fn to_csd(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for unit in self.arrays.iter().flat_map(|a| a.units.iter()) {
            buf.put_slice(&START_CODE);
            buf.put_slice(unit);
        }
        buf.freeze()
    }

    /// Picture size from the first SPS
    pub fn video_size(&self) -> Option<(u32, u32)> {
        let sps = self.units(NAL_UNIT_TYPE_SPS).next()?;
        HevcSps::parse(sps).ok().map(|sps| (sps.width, sps.height))
    }
}

/// Fields read from the head of an HEVC sequence parameter set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcSps {
    pub max_sub_layers: u8,
    pub temporal_id_nesting: bool,
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub chroma_format_idc: u8,
    pub width: u32,
    pub height: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
}

impl HevcSps {
    /// Parse a complete SPS NAL unit including its two-byte header
    pub fn parse(nalu: &[u8]) -> Result<Self> {
        if nalu.len() < 3 || nal_unit_type(nalu[0]) != NAL_UNIT_TYPE_SPS {
            return Err(MediaError::InvalidHevcRecord.into());
        }
        let rbsp = unescape_rbsp(&nalu[2..]);
        let mut r = BitReader::new(&rbsp);

        r.skip(4)?; // sps_video_parameter_set_id
        let max_sub_layers_minus1 = r.bits(3)? as u8;
        let temporal_id_nesting = r.bit()?;

        let general_profile_space = r.bits(2)? as u8;
        let general_tier_flag = r.bit()?;
        let general_profile_idc = r.bits(5)? as u8;
        let general_profile_compatibility_flags = r.bits(32)? as u32;
        let general_constraint_indicator_flags = r.bits(48)?;
        let general_level_idc = r.bits(8)? as u8;

        let mut profile_present = [false; 8];
        let mut level_present = [false; 8];
        for i in 0..max_sub_layers_minus1 as usize {
            profile_present[i] = r.bit()?;
            level_present[i] = r.bit()?;
        }
        if max_sub_layers_minus1 > 0 {
            for _ in max_sub_layers_minus1..8 {
                r.skip(2)?;
            }
        }
        for i in 0..max_sub_layers_minus1 as usize {
            if profile_present[i] {
                r.skip(88)?;
            }
            if level_present[i] {
                r.skip(8)?;
            }
        }

        r.ue()?; // sps_seq_parameter_set_id
        let chroma_format_idc = r.ue()? as u8;
        if chroma_format_idc == 3 {
            r.skip(1)?; // separate_colour_plane_flag
        }
        let mut width = r.ue()?;
        let mut height = r.ue()?;
        if r.bit()? {
            // conformance window, in chroma units
            let (sub_width, sub_height) = match chroma_format_idc {
                1 => (2, 2),
                2 => (2, 1),
                _ => (1, 1),
            };
            let left = r.ue()?;
            let right = r.ue()?;
            let top = r.ue()?;
            let bottom = r.ue()?;
            width = width.saturating_sub(sub_width * (left + right));
            height = height.saturating_sub(sub_height * (top + bottom));
        }
        let bit_depth_luma_minus8 = r.ue()? as u8;
        let bit_depth_chroma_minus8 = r.ue()? as u8;

        Ok(Self {
            max_sub_layers: max_sub_layers_minus1 + 1,
            temporal_id_nesting,
            general_profile_space,
            general_tier_flag,
            general_profile_idc,
            general_profile_compatibility_flags,
            general_constraint_indicator_flags,
            general_level_idc,
            chroma_format_idc,
            width,
            height,
            bit_depth_luma_minus8,
            bit_depth_chroma_minus8,
        })
    }
}

/// Drop emulation prevention bytes (`00 00 03` -> `00 00`)
fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Result<bool> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or(MediaError::InvalidHevcRecord)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    fn bits(&mut self, n: u32) -> Result<u64> {
        let mut value = 0u64;
        for _ in 0..n {
            value = (value << 1) | self.bit()? as u64;
        }
        Ok(value)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() * 8 {
            return Err(MediaError::InvalidHevcRecord.into());
        }
        self.pos += n;
        Ok(())
    }

    /// Unsigned Exp-Golomb
    fn ue(&mut self) -> Result<u32> {
        let mut leading_zeros = 0;
        while !self.bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(MediaError::InvalidHevcRecord.into());
            }
        }
        Ok(((1u64 << leading_zeros) - 1 + self.bits(leading_zeros)?) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Main profile 1280x720 parameter sets from an x265 stream
    const VPS: &[u8] = &[
        0x40, 0x01, 0x0C, 0x01, 0xFF, 0xFF, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00,
        0x00, 0x03, 0x00, 0x00, 0x03, 0x00, 0x5D, 0x95, 0x98, 0x09,
    ];
    const SPS: &[u8] = &[
        0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00,
        0x00, 0x03, 0x00, 0x5D, 0xA0, 0x02, 0x80, 0x80, 0x2D, 0x16, 0x59, 0x59, 0xA4, 0x93,
        0x2B, 0xC0, 0x40, 0x40, 0x00, 0x00, 0x03, 0x00, 0x40, 0x00, 0x00, 0x07, 0x82,
    ];
    const PPS: &[u8] = &[0x44, 0x01, 0xC1, 0x72, 0xB4, 0x62, 0x40];

    fn csd() -> Vec<u8> {
        let mut data = Vec::new();
        for unit in [VPS, SPS, PPS] {
            data.extend_from_slice(&START_CODE);
            data.extend_from_slice(unit);
        }
        data
    }

    #[test]
    fn test_sps_fields() {
        let sps = HevcSps::parse(SPS).unwrap();
        assert_eq!(sps.general_profile_idc, 1);
        assert_eq!(sps.general_level_idc, 93);
        assert_eq!(sps.general_profile_compatibility_flags, 0x6000_0000);
        assert_eq!(sps.general_constraint_indicator_flags, 0x9000_0000_0000);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!((sps.width, sps.height), (1280, 720));
        assert_eq!(sps.bit_depth_luma_minus8, 0);
        assert_eq!(sps.max_sub_layers, 1);
    }

    #[test]
    fn test_record_from_parameter_sets() {
        let config = HevcConfig::from_annex_b(&csd()).unwrap();
        assert_eq!(config.arrays.len(), 3);
        assert_eq!(config.general_profile_idc, 1);
        assert_eq!(config.chroma_format, 1);
        assert_eq!(config.nalu_length_size(), 4);
        assert_eq!(config.video_size(), Some((1280, 720)));
        assert_eq!(&config.to_csd()[..], &csd()[..]);

        let mut buf = BytesMut::new();
        config.encode(&mut buf);
        assert_eq!(buf.len(), config.encoded_len());
        assert_eq!(buf[0], 1);
        assert_eq!(buf[1], 0x01);
        assert_eq!(buf[12], 93);
        assert_eq!(buf[13] & 0xF0, 0xF0);
        assert_eq!(buf[21], 0x0F);
        assert_eq!(buf[22], 3);
        assert_eq!(buf[23], NAL_UNIT_TYPE_VPS);

        let parsed = HevcConfig::parse(buf.freeze()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_parse_rejects_truncated_record() {
        let config = HevcConfig::from_annex_b(&csd()).unwrap();
        let mut buf = BytesMut::new();
        config.encode(&mut buf);
        let truncated = buf.freeze().slice(..40);
        assert!(HevcConfig::parse(truncated).is_err());
        assert!(HevcConfig::parse(Bytes::from_static(&[1, 2, 3])).is_err());
    }

    #[test]
    fn test_missing_sps() {
        let mut data = START_CODE.to_vec();
        data.extend_from_slice(PPS);
        assert!(HevcConfig::from_annex_b(&data).is_err());
    }

    #[test]
    fn test_nal_unit_types() {
        assert_eq!(nal_unit_type(0x40), NAL_UNIT_TYPE_VPS);
        assert_eq!(nal_unit_type(0x42), NAL_UNIT_TYPE_SPS);
        assert!(is_irap(0x26)); // IDR_W_RADL
        assert!(!is_irap(0x02)); // TRAIL_R
    }
}
