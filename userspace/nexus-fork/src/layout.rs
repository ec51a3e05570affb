// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual-memory layout consumed by the fork protocol
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! The OS build uses [`Layout::DEFAULT`]. Host builds may load a profile from
//! TOML; missing keys fall back to the default and every profile is validated
//! before use.

#[cfg(feature = "std")]
use std::{fs, path::Path, path::PathBuf};

use nexus_abi::{page_number, PAGE_SIZE};

/// Fixed addresses the protocol depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Top of the user exception stack; its single page sits just below.
    pub uxstacktop: usize,
    /// Scratch page used while copying a faulting page.
    pub pftemp: usize,
    /// Base of the read-only page-table window.
    pub uvpt: usize,
}

impl Layout {
    /// Layout of the stock user address space.
    pub const DEFAULT: Self = Self { uxstacktop: 0xeec0_0000, pftemp: 0x007f_f000, uvpt: 0xef40_0000 };

    /// Base address of the exception stack page.
    pub const fn exception_stack(&self) -> usize {
        self.uxstacktop - PAGE_SIZE
    }

    /// Number of pages subject to duplication, counted from page 0.
    pub const fn duplicable_pages(&self) -> usize {
        page_number(self.exception_stack())
    }

    /// Checks alignment and the relative placement of the fixed pages.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.uxstacktop % PAGE_SIZE != 0 {
            return Err(invalid("uxstacktop is not page aligned"));
        }
        if self.pftemp % PAGE_SIZE != 0 {
            return Err(invalid("pftemp is not page aligned"));
        }
        if self.uvpt % PAGE_SIZE != 0 {
            return Err(invalid("uvpt is not page aligned"));
        }
        if self.uxstacktop < 2 * PAGE_SIZE {
            return Err(invalid("no pages below the exception stack"));
        }
        if self.pftemp >= self.exception_stack() {
            return Err(invalid("pftemp must sit below the exception stack"));
        }
        if self.uvpt < self.uxstacktop {
            return Err(invalid("uvpt overlaps the user range"));
        }
        Ok(())
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

const fn invalid(reason: &'static str) -> LayoutError {
    LayoutError::Invalid { reason }
}

/// Errors produced while loading or validating a layout.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    /// Layout values are inconsistent.
    #[error("invalid layout: {reason}")]
    Invalid {
        /// What is wrong.
        reason: &'static str,
    },
    /// Failed to read a layout profile.
    #[cfg(feature = "std")]
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Profile location.
        path: PathBuf,
        /// Underlying operating system error.
        source: std::io::Error,
    },
    /// TOML parsing failed for a layout profile.
    #[cfg(feature = "std")]
    #[error("failed to parse layout profile: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(feature = "std")]
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLayout {
    uxstacktop: Option<usize>,
    pftemp: Option<usize>,
    uvpt: Option<usize>,
}

#[cfg(feature = "std")]
impl Layout {
    /// Parses a TOML profile such as `uxstacktop = 0x0100_0000`.
    pub fn from_toml_str(raw: &str) -> Result<Self, LayoutError> {
        let raw: RawLayout = toml::from_str(raw)?;
        let layout = Self {
            uxstacktop: raw.uxstacktop.unwrap_or(Self::DEFAULT.uxstacktop),
            pftemp: raw.pftemp.unwrap_or(Self::DEFAULT.pftemp),
            uvpt: raw.uvpt.unwrap_or(Self::DEFAULT.uvpt),
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Reads and parses a TOML profile from `path`.
    pub fn load(path: &Path) -> Result<Self, LayoutError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| LayoutError::Io { path: path.to_path_buf(), source })?;
        let layout = Self::from_toml_str(&raw)?;
        log::debug!(
            "layout: loaded {} (uxstacktop={:#x} pftemp={:#x})",
            path.display(),
            layout.uxstacktop,
            layout.pftemp
        );
        Ok(layout)
    }
}
