//! Wormhole chain ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Wormhole chain id. Not every id has a name; unknown ids display as numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(u16);

impl ChainId {
    pub const SOLANA: Self = Self(1);
    pub const ETHEREUM: Self = Self(2);
    pub const TERRA: Self = Self(3);
    pub const BSC: Self = Self(4);
    pub const POLYGON: Self = Self(5);
    pub const AVALANCHE: Self = Self(6);
    pub const OASIS: Self = Self(7);
    pub const FANTOM: Self = Self(10);
    pub const KARURA: Self = Self(11);
    pub const ACALA: Self = Self(12);
    pub const KLAYTN: Self = Self(13);
    pub const CELO: Self = Self(14);
    pub const MOONBEAM: Self = Self(16);
    pub const TERRA2: Self = Self(18);
    pub const APTOS: Self = Self(22);
    pub const ARBITRUM: Self = Self(23);
    pub const OPTIMISM: Self = Self(24);
    pub const BASE: Self = Self(30);

    const NAMED: [(Self, &'static str); 18] = [
        (Self::SOLANA, "solana"),
        (Self::ETHEREUM, "ethereum"),
        (Self::TERRA, "terra"),
        (Self::BSC, "bsc"),
        (Self::POLYGON, "polygon"),
        (Self::AVALANCHE, "avalanche"),
        (Self::OASIS, "oasis"),
        (Self::FANTOM, "fantom"),
        (Self::KARURA, "karura"),
        (Self::ACALA, "acala"),
        (Self::KLAYTN, "klaytn"),
        (Self::CELO, "celo"),
        (Self::MOONBEAM, "moonbeam"),
        (Self::TERRA2, "terra2"),
        (Self::APTOS, "aptos"),
        (Self::ARBITRUM, "arbitrum"),
        (Self::OPTIMISM, "optimism"),
        (Self::BASE, "base"),
    ];

    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(id, _)| *id == self)
            .map(|(_, name)| *name)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::NAMED
            .iter()
            .find(|(_, known)| *known == name)
            .map(|(id, _)| *id)
    }
}

impl From<u16> for ChainId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Accepts a known name or a numeric id.
impl FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = Self::from_name(s) {
            return Ok(id);
        }
        s.trim()
            .parse::<u16>()
            .map(Self)
            .map_err(|_| format!("unknown chain '{s}'"))
    }
}
