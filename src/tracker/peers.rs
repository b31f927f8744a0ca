use serde::de::{self, SeqAccess, Visitor};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddrV4};

/// peer list of an announce response, either the compact byte string or a list of dictionaries.
/// ipv6 entries of the dictionary form are skipped.
#[derive(Debug, Clone, Default)]
pub struct PeerAddresses(Vec<SocketAddrV4>);

impl PeerAddresses {
    pub fn into_inner(self) -> Vec<SocketAddrV4> {
        self.0
    }
}

impl AsRef<[SocketAddrV4]> for PeerAddresses {
    fn as_ref(&self) -> &[SocketAddrV4] {
        &self.0
    }
}

impl<'de> Deserialize<'de> for PeerAddresses {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(PeerAddresses(
            deserializer.deserialize_any(SocketAddressesVisitor)?,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}

struct SocketAddressesVisitor;
impl SocketAddressesVisitor {
    const SOCKET_ADDR_SIZE_BYTES: usize = 6;
}

impl<'de> Visitor<'de> for SocketAddressesVisitor {
    type Value = Vec<SocketAddrV4>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str(
            "a byte string of 6 byte socket addresses (4 bytes ipv4, 2 bytes port) or a list of \
             peer dictionaries",
        )
    }

    fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let addr_byte_chunks = bytes.chunks_exact(Self::SOCKET_ADDR_SIZE_BYTES);

        if !addr_byte_chunks.remainder().is_empty() {
            return Err(E::custom(
                "socket addresses byte string should have a length which is a multiple of 6",
            ));
        }

        let socket_addresses = addr_byte_chunks
            .map(|chunk| {
                let ip_addr = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddrV4::new(ip_addr, port)
            })
            .collect();

        Ok(socket_addresses)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut socket_addresses = Vec::new();
        while let Some(DictPeer { ip, port }) = seq.next_element()? {
            if let Ok(ip_addr) = ip.parse::<Ipv4Addr>() {
                socket_addresses.push(SocketAddrV4::new(ip_addr, port));
            }
        }
        Ok(socket_addresses)
    }
}
