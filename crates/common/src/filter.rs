//! `VID:PID` device filters
//!
//! Accepted forms: `0781:5567`, `0x0781:0x5567`, `0781:*`, `*:*`.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|vid| vid == vendor_id)
            && self.product_id.is_none_or(|pid| pid == product_id)
    }

    fn parse_id(part: &str, name: &str) -> Result<Option<u16>> {
        let part = part.trim();
        if part == "*" {
            return Ok(None);
        }
        let digits = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .unwrap_or(part);
        u16::from_str_radix(digits, 16)
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid {} '{}', expected hex (e.g. 0781)", name, part)))
    }
}

impl FromStr for DeviceFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (vid, pid) = s.split_once(':').ok_or_else(|| {
            Error::Config(format!(
                "Invalid filter format '{}', expected VID:PID (e.g. '0781:5567' or '0781:*')",
                s
            ))
        })?;
        Ok(Self {
            vendor_id: Self::parse_id(vid, "VID")?,
            product_id: Self::parse_id(pid, "PID")?,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(vid) => write!(f, "{:04x}", vid)?,
            None => f.write_str("*")?,
        }
        f.write_str(":")?;
        match self.product_id {
            Some(pid) => write!(f, "{:04x}", pid),
            None => f.write_str("*"),
        }
    }
}

impl Serialize for DeviceFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DeviceFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
