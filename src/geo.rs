use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;

const LOOKUP_URL: &str = "https://ipapi.co/json/";

pub const MASKED_IP: &str = "xxx.xxx.xxx";
pub const UNKNOWN_FLAG: &str = "\u{1F3F3}\u{FE0F}";

/// What the status line shows when `show_ip` is on. Lookups are best effort;
/// any failure degrades to `placeholder()` and never surfaces an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    pub masked_ip: String,
    pub flag: String,
    pub country: String,
}

pub fn placeholder() -> GeoInfo {
    GeoInfo {
        masked_ip: MASKED_IP.to_string(),
        flag: UNKNOWN_FLAG.to_string(),
        country: String::new(),
    }
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    country_code: String,
    #[serde(default)]
    country_name: String,
}

pub fn lookup() -> Result<GeoInfo> {
    let client = Client::builder()
        .timeout(Duration::from_secs(8))
        .user_agent(format!(
            "chan-tui/{version} (geo-lookup)",
            version = crate::VERSION
        ))
        .build()
        .context("build geo HTTP client")?;

    let response = client.get(LOOKUP_URL).send().context("request ip lookup")?;

    if !response.status().is_success() {
        bail!("ip lookup failed with status {}", response.status());
    }

    let data: LookupResponse = response.json().context("decode ip lookup response")?;

    Ok(GeoInfo {
        masked_ip: mask_ip(&data.ip),
        flag: flag_for(&data.country_code).to_string(),
        country: data.country_name,
    })
}

/// Mask the final octet; anything that is not a dotted quad masks fully.
pub fn mask_ip(ip: &str) -> String {
    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() == 4 && parts.iter().all(|part| part.parse::<u8>().is_ok()) {
        format!("{}.{}.{}.xxx", parts[0], parts[1], parts[2])
    } else {
        MASKED_IP.to_string()
    }
}

pub fn flag_for(country_code: &str) -> &'static str {
    match country_code.to_ascii_uppercase().as_str() {
        "US" => "\u{1F1FA}\u{1F1F8}",
        "GB" => "\u{1F1EC}\u{1F1E7}",
        "CA" => "\u{1F1E8}\u{1F1E6}",
        "AU" => "\u{1F1E6}\u{1F1FA}",
        "DE" => "\u{1F1E9}\u{1F1EA}",
        "FR" => "\u{1F1EB}\u{1F1F7}",
        "NL" => "\u{1F1F3}\u{1F1F1}",
        "SE" => "\u{1F1F8}\u{1F1EA}",
        "NO" => "\u{1F1F3}\u{1F1F4}",
        "FI" => "\u{1F1EB}\u{1F1EE}",
        "PL" => "\u{1F1F5}\u{1F1F1}",
        "IT" => "\u{1F1EE}\u{1F1F9}",
        "ES" => "\u{1F1EA}\u{1F1F8}",
        "BR" => "\u{1F1E7}\u{1F1F7}",
        "MX" => "\u{1F1F2}\u{1F1FD}",
        "JP" => "\u{1F1EF}\u{1F1F5}",
        "KR" => "\u{1F1F0}\u{1F1F7}",
        "CN" => "\u{1F1E8}\u{1F1F3}",
        "IN" => "\u{1F1EE}\u{1F1F3}",
        "RU" => "\u{1F1F7}\u{1F1FA}",
        _ => UNKNOWN_FLAG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_final_octet() {
        assert_eq!(mask_ip("203.0.113.7"), "203.0.113.xxx");
        assert_eq!(mask_ip("10.0.0.254"), "10.0.0.xxx");
    }

    #[test]
    fn masks_everything_else_fully() {
        assert_eq!(mask_ip(""), MASKED_IP);
        assert_eq!(mask_ip("not an ip"), MASKED_IP);
        assert_eq!(mask_ip("2001:db8::1"), MASKED_IP);
        assert_eq!(mask_ip("300.1.1.1"), MASKED_IP);
    }

    #[test]
    fn known_codes_map_to_flags() {
        assert_eq!(flag_for("us"), "\u{1F1FA}\u{1F1F8}");
        assert_eq!(flag_for("JP"), "\u{1F1EF}\u{1F1F5}");
        assert_eq!(flag_for("ZZ"), UNKNOWN_FLAG);
        assert_eq!(flag_for(""), UNKNOWN_FLAG);
    }

    #[test]
    fn placeholder_is_fully_masked() {
        let info = placeholder();
        assert_eq!(info.masked_ip, MASKED_IP);
        assert_eq!(info.flag, UNKNOWN_FLAG);
    }
}
