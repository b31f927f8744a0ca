use reqwest::IntoUrl;
use serde::{de::Visitor, Deserialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerUrl {
    Http(String),
    Udp(String),
}

impl TrackerUrl {
    pub fn new(url: impl IntoUrl) -> anyhow::Result<Self> {
        let url = url.into_url()?;
        Ok(match url.scheme() {
            "http" | "https" => Self::Http(url.into()),
            "udp" => Self::Udp(url.into()),
            scheme => anyhow::bail!("unsupported scheme {:?} for tracker", scheme),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Http(url) | Self::Udp(url) => url,
        }
    }
}

impl std::fmt::Display for TrackerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'a> Deserialize<'a> for TrackerUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        deserializer.deserialize_string(TrackerUrlVisitor)
    }
}

struct TrackerUrlVisitor;
impl<'a> Visitor<'a> for TrackerUrlVisitor {
    type Value = TrackerUrl;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("string url using udp or http scheme")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        TrackerUrl::new(v).map_err(serde::de::Error::custom)
    }

    // bencode strings are byte strings, this is what serde_bencode ends up calling.
    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        let url = std::str::from_utf8(v).map_err(serde::de::Error::custom)?;
        self.visit_str(url)
    }
}
