use std::iter::zip;

use super::KmsError;

/// One entry of a `GAMMA_LUT` blob, laid out like the kernel's `struct drm_color_lut`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrmColorLut {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
    pub reserved: u16,
}

/// Per-channel gamma table, stored as all red entries, then green, then blue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaRamp {
    table: Vec<u16>,
}

impl GammaRamp {
    /// A linear ramp of `size` entries per channel.
    pub fn linear(size: usize) -> Self {
        let _span = tracy_client::span!("GammaRamp::linear");

        let mut table = vec![0u16; size * 3];
        if size > 1 {
            let denom = size as u64 - 1;
            let (red, rest) = table.split_at_mut(size);
            let (green, blue) = rest.split_at_mut(size);
            for (i, ((r, g), b)) in zip(zip(red, green), blue).enumerate() {
                let value = (0xFFFFu64 * i as u64 / denom) as u16;
                *r = value;
                *g = value;
                *b = value;
            }
        }

        Self { table }
    }

    pub fn from_channels(red: &[u16], green: &[u16], blue: &[u16]) -> Result<Self, KmsError> {
        if red.len() != green.len() || red.len() != blue.len() {
            return Err(KmsError::Malformed(String::from(
                "gamma channels have different lengths",
            )));
        }

        let mut table = Vec::with_capacity(red.len() * 3);
        table.extend_from_slice(red);
        table.extend_from_slice(green);
        table.extend_from_slice(blue);
        Ok(Self { table })
    }

    /// Builds a ramp from the concatenated red, green and blue tables.
    pub fn from_table(table: Vec<u16>) -> Result<Self, KmsError> {
        if table.len() % 3 != 0 {
            return Err(KmsError::Malformed(format!(
                "gamma table length {} is not a multiple of 3",
                table.len()
            )));
        }
        Ok(Self { table })
    }

    /// Entries per channel.
    pub fn size(&self) -> usize {
        self.table.len() / 3
    }

    pub fn red(&self) -> &[u16] {
        &self.table[..self.size()]
    }

    pub fn green(&self) -> &[u16] {
        &self.table[self.size()..self.size() * 2]
    }

    pub fn blue(&self) -> &[u16] {
        &self.table[self.size() * 2..]
    }

    pub fn to_color_lut(&self) -> Vec<DrmColorLut> {
        zip(zip(self.red(), self.green()), self.blue())
            .map(|((&red, &green), &blue)| DrmColorLut {
                red,
                green,
                blue,
                reserved: 0,
            })
            .collect()
    }

    /// Bytes of a `GAMMA_LUT` blob.
    pub fn to_blob_data(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.to_color_lut()).to_vec()
    }
}
