//! Parsing of `$ZVersion` strings.

use dbx_protocol::leading_int;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ISC_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r" (\d+)\.(\d*)").expect("valid version pattern"));
static ISC_BUILD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Build (\d+)").expect("valid build pattern"));
static YDB_MAJOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"V(\d+)").expect("valid version pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Product {
    Cache,
    Iris,
    YottaDb,
    Gtm,
}

impl Product {
    pub fn label(self) -> &'static str {
        match self {
            Product::Cache => "InterSystems Cache",
            Product::Iris => "InterSystems IRIS",
            Product::YottaDb => "YottaDB",
            Product::Gtm => "GT.M",
        }
    }
}

/// Decoded server version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub product: Product,
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub vnumber: u32,
    pub text: String,
}

impl VersionInfo {
    /// Parse a Cache/IRIS version string such as
    /// `"IRIS for UNIX (Ubuntu Server LTS for x86-64) 2019.2 (Build 107U)"`.
    pub fn parse_isc(text: &str) -> Option<Self> {
        let product = if text.contains("Cache") {
            Product::Cache
        } else {
            Product::Iris
        };

        let (start, major, minor) = ISC_CANDIDATE.captures_iter(text).find_map(|caps| {
            let whole = caps.get(0)?;
            let major_digits = caps.get(1)?.as_str();
            let minor_digits = caps.get(2)?.as_str();
            let value: f64 = format!(
                "{}.{}",
                major_digits,
                if minor_digits.is_empty() { "0" } else { minor_digits }
            )
            .parse()
            .ok()?;
            let accepted = (major_digits.len() == 1 && (1.0..=5.2).contains(&value))
                || (major_digits.len() == 4 && value >= 2000.0);
            if !accepted {
                return None;
            }
            Some((
                whole.start(),
                major_digits.parse::<u32>().ok()?,
                field(minor_digits)?,
            ))
        })?;

        let build = ISC_BUILD
            .captures(&text[start..])
            .and_then(|caps| caps.get(1))
            .map(|m| field(m.as_str()))
            .unwrap_or(Some(0))?;

        let vnumber = if major >= 2007 {
            vnumber(major - 2000, minor, build)?
        } else {
            vnumber(major, minor, build)?
        };

        Some(Self {
            product,
            major,
            minor,
            build,
            vnumber,
            text: text.to_string(),
        })
    }

    /// Parse a YottaDB/GT.M version string such as `"GT.M V6.3-004 Linux x86_64"`.
    pub fn parse_ydb(text: &str, product: Product) -> Option<Self> {
        let caps = YDB_MAJOR.captures(text)?;
        let digits = caps.get(1)?;
        let major: u32 = digits.as_str().parse().ok()?;
        let rest = &text[digits.start()..];

        let minor = rest
            .find('.')
            .map(|i| field(&rest[i + 1..]))
            .unwrap_or(Some(0))?;
        if major == 0 && minor == 0 {
            return None;
        }

        let build = if let Some(i) = rest.find('-') {
            field(&rest[i + 1..])?
        } else if let Some(i) = rest.find(".b") {
            field(&rest[i + 2..])?
        } else {
            0
        };

        Some(Self {
            product,
            major,
            minor,
            build,
            vnumber: vnumber(major, minor, build)?,
            text: text.to_string(),
        })
    }

    /// `"<major>.<minor>.b<build>"`
    pub fn normalised(&self) -> String {
        format!("{}.{}.b{}", self.major, self.minor, self.build)
    }
}

/// Leading number of a version field; `None` when it does not fit a `u32`.
fn field(text: &str) -> Option<u32> {
    u32::try_from(leading_int(text.as_bytes())).ok()
}

/// `major * 100000 + minor * 10000 + build`, or `None` on overflow.
fn vnumber(major: u32, minor: u32, build: u32) -> Option<u32> {
    major
        .checked_mul(100_000)?
        .checked_add(minor.checked_mul(10_000)?)?
        .checked_add(build)
}

/// Version string reported for a connection.
pub fn describe(crate_version: &str, server: Option<&VersionInfo>) -> String {
    match server {
        Some(info) => format!(
            "dbx-bridge:{}; {}:{}",
            crate_version,
            info.product.label(),
            info.normalised()
        ),
        None => format!("dbx-bridge:{}", crate_version),
    }
}
