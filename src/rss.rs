//! Receive-side scaling: hash key and hashed-field selection for the
//! distribution QP.

use bitflags::bitflags;

use crate::errors::ConfigError;

pub const TOEPLITZ_HASH_KEY_SIZE: usize = 40;

pub const DEFAULT_RSS_KEY: [u8; TOEPLITZ_HASH_KEY_SIZE] = [
    0x2c, 0xc6, 0x81, 0xd1, 0x5b, 0xdb, 0xf4, 0xf7, 0xfc, 0xa2, 0x83, 0x19, 0xdb, 0x1a, 0x3e,
    0x94, 0x6b, 0x9e, 0x38, 0xd9, 0x2c, 0x9c, 0x03, 0xd1, 0xad, 0x99, 0x44, 0xa7, 0xd9, 0x56,
    0x3d, 0x59, 0x06, 0x3c, 0x25, 0xf3, 0xfc, 0x1f, 0xdc, 0x2a,
];

bitflags! {
    /// Protocols the caller wants flows distributed on.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RssHf: u32 {
        const IPV4 = 1 << 0;
        const IPV6 = 1 << 1;
        const TCP = 1 << 2;
        const UDP = 1 << 3;
    }
}

bitflags! {
    /// Packet fields fed to the hash function.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxHashFields: u64 {
        const SRC_IPV4 = 1 << 0;
        const DST_IPV4 = 1 << 1;
        const SRC_IPV6 = 1 << 2;
        const DST_IPV6 = 1 << 3;
        const SRC_PORT_TCP = 1 << 4;
        const DST_PORT_TCP = 1 << 5;
        const SRC_PORT_UDP = 1 << 6;
        const DST_PORT_UDP = 1 << 7;
    }
}

/// Fields hashed when no protocol is requested. Wider than the IPv4-only
/// default of the MANA PMD: IPv6 addresses are hashed too.
pub const DEFAULT_HASH_FIELDS: RxHashFields = RxHashFields::SRC_IPV4
    .union(RxHashFields::DST_IPV4)
    .union(RxHashFields::SRC_IPV6)
    .union(RxHashFields::DST_IPV6);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxHashFunction {
    Toeplitz,
}

/// What the hash QP is created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxHashConf {
    pub function: RxHashFunction,
    pub key: [u8; TOEPLITZ_HASH_KEY_SIZE],
    pub fields: RxHashFields,
}

/// Caller-supplied RSS settings. An empty key or empty flag set selects
/// the built-in default for that half.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RssConf {
    pub key: Option<Vec<u8>>,
    pub hf: RssHf,
}

impl RssConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.key.as_deref() {
            None | Some([]) => Ok(()),
            Some(k) if k.len() == TOEPLITZ_HASH_KEY_SIZE => Ok(()),
            Some(k) => Err(ConfigError::HashKeyLength {
                expected: TOEPLITZ_HASH_KEY_SIZE,
                got: k.len(),
            }),
        }
    }

    pub fn hash_conf(&self) -> Result<RxHashConf, ConfigError> {
        self.validate()?;
        let mut key = DEFAULT_RSS_KEY;
        if let Some(k) = self.key.as_deref().filter(|k| !k.is_empty()) {
            key.copy_from_slice(k);
        }
        Ok(RxHashConf {
            function: RxHashFunction::Toeplitz,
            key,
            fields: hash_fields(self.hf),
        })
    }
}

/// Maps protocol flags to hashed fields. Each protocol only ever adds its
/// own fields; no flags at all means [`DEFAULT_HASH_FIELDS`].
pub fn hash_fields(hf: RssHf) -> RxHashFields {
    if hf.is_empty() {
        return DEFAULT_HASH_FIELDS;
    }

    let mut fields = RxHashFields::empty();
    if hf.contains(RssHf::IPV4) {
        fields |= RxHashFields::SRC_IPV4 | RxHashFields::DST_IPV4;
    }
    if hf.contains(RssHf::IPV6) {
        fields |= RxHashFields::SRC_IPV6 | RxHashFields::DST_IPV6;
    }
    if hf.contains(RssHf::TCP) {
        fields |= RxHashFields::SRC_PORT_TCP | RxHashFields::DST_PORT_TCP;
    }
    if hf.contains(RssHf::UDP) {
        fields |= RxHashFields::SRC_PORT_UDP | RxHashFields::DST_PORT_UDP;
    }
    fields
}

/// Parses a comma separated protocol list such as `ipv4,tcp`.
pub fn parse_rss_hf(s: &str) -> Result<RssHf, String> {
    let mut hf = RssHf::empty();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        hf |= match part.to_ascii_lowercase().as_str() {
            "ipv4" => RssHf::IPV4,
            "ipv6" => RssHf::IPV6,
            "tcp" => RssHf::TCP,
            "udp" => RssHf::UDP,
            other => return Err(format!("unknown rss protocol `{other}`")),
        };
    }
    Ok(hf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_alone_hashes_only_tcp_ports() {
        assert_eq!(
            hash_fields(RssHf::TCP),
            RxHashFields::SRC_PORT_TCP | RxHashFields::DST_PORT_TCP
        );
    }

    #[test]
    fn no_flags_selects_default_not_empty() {
        let fields = hash_fields(RssHf::empty());
        assert_eq!(fields, DEFAULT_HASH_FIELDS);
        assert!(!fields.is_empty());
    }

    #[test]
    fn flags_accumulate() {
        let fields = hash_fields(RssHf::IPV4 | RssHf::UDP);
        assert_eq!(
            fields,
            RxHashFields::SRC_IPV4
                | RxHashFields::DST_IPV4
                | RxHashFields::SRC_PORT_UDP
                | RxHashFields::DST_PORT_UDP
        );
        let v6 = hash_fields(RssHf::IPV6);
        assert!(v6.contains(RxHashFields::SRC_IPV6 | RxHashFields::DST_IPV6));
        assert!(!v6.intersects(RxHashFields::SRC_IPV4 | RxHashFields::DST_IPV4));
    }

    #[test]
    fn key_selection() {
        let conf = RssConf::default().hash_conf().unwrap();
        assert_eq!(conf.key, DEFAULT_RSS_KEY);
        assert_eq!(conf.function, RxHashFunction::Toeplitz);

        let custom = RssConf {
            key: Some(vec![0xab; TOEPLITZ_HASH_KEY_SIZE]),
            hf: RssHf::empty(),
        };
        assert_eq!(custom.hash_conf().unwrap().key, [0xab; TOEPLITZ_HASH_KEY_SIZE]);

        let empty = RssConf {
            key: Some(Vec::new()),
            hf: RssHf::TCP,
        };
        assert_eq!(empty.hash_conf().unwrap().key, DEFAULT_RSS_KEY);

        let short = RssConf {
            key: Some(vec![1; 16]),
            hf: RssHf::empty(),
        };
        assert_eq!(
            short.hash_conf(),
            Err(ConfigError::HashKeyLength {
                expected: TOEPLITZ_HASH_KEY_SIZE,
                got: 16
            })
        );
    }

    #[test]
    fn parses_protocol_lists() {
        assert_eq!(parse_rss_hf("ipv4, TCP").unwrap(), RssHf::IPV4 | RssHf::TCP);
        assert_eq!(parse_rss_hf("").unwrap(), RssHf::empty());
        assert!(parse_rss_hf("sctp").is_err());
    }
}
