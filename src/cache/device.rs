//! Device-class detection.
//!
//! The mobile user-agent pattern lives here and nowhere else. The rewrite rule
//! generator embeds [`MOBILE_USER_AGENT_PATTERN`] verbatim, and the gateway and
//! the snapshot writer compile the same string, so all three agree on which
//! variant a visitor gets.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Case-insensitive alternation matched against the `User-Agent` header.
pub const MOBILE_USER_AGENT_PATTERN: &str = "(2.0 MMP|240x320|400X240|AvantGo|BlackBerry|Blazer|Cellphone|Danger|DoCoMo|Elaine/3.0|EudoraWeb|Googlebot-Mobile|hiptop|IEMobile|KYOCERA/WX310K|LG/U990|MIDP-2.|MMEF20|MOT-V|NetFront|Newt|Nintendo Wii|Nitro|Nokia|Opera Mini|Palm|PlayStation Portable|portalmmm|Proxinet|ProxiNet|SHARP-TQ-GX10|SHG-i900|Small|SonyEricsson|Symbian OS|SymbianOS|TS21i-10|UP.Browser|UP.Link|webOS|Windows CE|WinWAP|YahooSeeker/M1A1-R2D2|iPhone|iPod|iPad|Android|BlackBerry9530|LG-TU915 Obigo|LGE VX|Nokia5800|Mobile)";

static MOBILE_USER_AGENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(&format!("(?i){MOBILE_USER_AGENT_PATTERN}")).ok());

/// Rendering variant a snapshot was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
}

impl DeviceClass {
    /// Classify a request by its user agent. A missing header is desktop.
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        match user_agent {
            Some(ua)
                if MOBILE_USER_AGENT
                    .as_ref()
                    .is_some_and(|pattern| pattern.is_match(ua)) =>
            {
                Self::Mobile
            }
            _ => Self::Desktop,
        }
    }

    /// File name of the snapshot for this variant.
    pub fn snapshot_file_name(self) -> &'static str {
        match self {
            Self::Desktop => "index.html",
            Self::Mobile => "index-mobile.html",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
