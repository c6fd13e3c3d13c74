//! Watcher configuration.
//!
//! Chains are described in a JSON file, one entry per watcher, with `family`
//! selecting the extractor:
//!
//! ```json
//! {
//!   "watchers": [
//!     {
//!       "family": "evm",
//!       "chain": "ethereum",
//!       "url": "https://rpc.ankr.com/eth",
//!       "rate_limit": 10,
//!       "size_blocks": 100,
//!       "wait_seconds": 5,
//!       "initial_block": 17000000,
//!       "contracts": {
//!         "0x3ee18b2214aff97000d974cf647e7c347e8fa585": {
//!           "0xc6878519": "completeTransfer"
//!         }
//!       }
//!     }
//!   ]
//! }
//! ```
//!
//! [`WatchersConfig::validate`] turns the raw entries into [`WatcherParams`].
//! Every problem is a [`ConfigError`] and aborts startup.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;
use watcher_common::{normalize_evm_address, normalize_move_address, normalize_selector, ChainId};

use crate::extractor::aptos::AptosModule;
use crate::extractor::evm::MethodTable;
use crate::extractor::solana::{CORE_BRIDGE_PROGRAM, TOKEN_BRIDGE_PROGRAM};
use crate::watcher::{RetryPolicy, WatcherSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid watcher config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{chain}: missing url")]
    MissingUrl { chain: String },
    #[error("{chain}: invalid url {url:?}: {source}")]
    InvalidUrl {
        chain: String,
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{chain}: invalid address {address:?}")]
    InvalidAddress { chain: String, address: String },
    #[error("{chain}: invalid method selector {selector:?}")]
    InvalidSelector { chain: String, selector: String },
    #[error("{chain}: size_blocks must be at least 1")]
    ZeroPageSize { chain: String },
    #[error("{chain}: no chain_id given and the name is not a known chain")]
    UnknownChainId { chain: String },
    #[error("{chain}: no tracked contracts or methods")]
    NothingTracked { chain: String },
    #[error("duplicate watcher for chain {0}")]
    DuplicateChain(String),
}

fn default_size_blocks() -> u64 {
    100
}

fn default_wait_seconds() -> u64 {
    5
}

fn default_attempts() -> u32 {
    10
}

fn default_delay_ms() -> u64 {
    5_000
}

/// Top-level config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchersConfig {
    #[serde(default)]
    pub watchers: Vec<RawWatcher>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRetry {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

/// One watcher entry as written in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWatcher {
    pub chain: String,
    /// Wormhole chain id; derived from `chain` when omitted.
    #[serde(default)]
    pub chain_id: Option<ChainId>,
    #[serde(default)]
    pub url: String,
    /// Requests per second; 0 disables limiting.
    #[serde(default)]
    pub rate_limit: f64,
    #[serde(default = "default_size_blocks")]
    pub size_blocks: u64,
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,
    #[serde(default)]
    pub initial_block: u64,
    #[serde(default)]
    pub retry: Option<RawRetry>,
    #[serde(flatten)]
    pub source: RawSource,
}

/// Family-specific part of an entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum RawSource {
    Evm {
        /// contract address -> selector -> method name
        contracts: HashMap<String, HashMap<String, String>>,
    },
    Ankr {
        /// Ankr blockchain name, `eth`, `bsc`, ...
        blockchain: String,
        contracts: HashMap<String, HashMap<String, String>>,
    },
    Solana {
        #[serde(default)]
        token_bridge: Option<String>,
        #[serde(default)]
        core_bridge: Option<String>,
    },
    Aptos {
        module_address: String,
        /// `module::function` -> method name
        functions: HashMap<String, String>,
    },
    Terra {
        fcd_url: String,
        contract: String,
        methods: Vec<String>,
    },
}

/// Validated family-specific parameters.
#[derive(Debug, Clone)]
pub enum SourceParams {
    Evm {
        methods: MethodTable,
    },
    Ankr {
        blockchain: String,
        methods: MethodTable,
    },
    Solana {
        token_bridge: String,
        core_bridge: String,
    },
    Aptos {
        module: AptosModule,
    },
    Terra {
        fcd_url: Url,
        contract: String,
        methods: Vec<String>,
    },
}

impl SourceParams {
    pub fn family(&self) -> &'static str {
        match self {
            SourceParams::Evm { .. } => "evm",
            SourceParams::Ankr { .. } => "ankr",
            SourceParams::Solana { .. } => "solana",
            SourceParams::Aptos { .. } => "aptos",
            SourceParams::Terra { .. } => "terra",
        }
    }
}

/// Static parameters of one watcher, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct WatcherParams {
    pub chain: String,
    pub chain_id: ChainId,
    pub url: Url,
    pub rate_limit: f64,
    pub size_blocks: u64,
    pub wait: Duration,
    pub initial_block: u64,
    pub retry: RetryPolicy,
    pub source: SourceParams,
}

impl WatcherParams {
    pub fn settings(&self) -> WatcherSettings {
        WatcherSettings {
            chain: self.chain.clone(),
            chain_id: self.chain_id,
            size_blocks: self.size_blocks,
            wait: self.wait,
            initial_block: self.initial_block,
            retry: self.retry.clone(),
        }
    }

    /// Replace the endpoint URL, as the backfiller's `--chain-url` does.
    pub fn with_url(mut self, url: &str) -> Result<Self, ConfigError> {
        self.url = parse_url(&self.chain, url)?;
        Ok(self)
    }
}

impl WatchersConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Validate every entry. Chain names must be unique since they key the
    /// cursors.
    pub fn validate(&self) -> Result<Vec<WatcherParams>, ConfigError> {
        let mut seen = HashSet::new();
        let mut params = Vec::with_capacity(self.watchers.len());
        for raw in &self.watchers {
            if !seen.insert(raw.chain.as_str()) {
                return Err(ConfigError::DuplicateChain(raw.chain.clone()));
            }
            params.push(raw.validate()?);
        }
        Ok(params)
    }
}

fn parse_url(chain: &str, url: &str) -> Result<Url, ConfigError> {
    if url.trim().is_empty() {
        return Err(ConfigError::MissingUrl {
            chain: chain.to_string(),
        });
    }
    Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
        chain: chain.to_string(),
        url: url.to_string(),
        source,
    })
}

fn method_table(chain: &str, contracts: &HashMap<String, HashMap<String, String>>) -> Result<MethodTable, ConfigError> {
    let mut table = MethodTable::new();
    for (address, selectors) in contracts {
        let address = normalize_evm_address(address).ok_or_else(|| ConfigError::InvalidAddress {
            chain: chain.to_string(),
            address: address.clone(),
        })?;
        let entry: &mut HashMap<String, String> = table.entry(address).or_default();
        for (selector, method) in selectors {
            let selector = normalize_selector(selector).ok_or_else(|| ConfigError::InvalidSelector {
                chain: chain.to_string(),
                selector: selector.clone(),
            })?;
            entry.insert(selector, method.clone());
        }
    }
    if table.values().all(HashMap::is_empty) {
        return Err(ConfigError::NothingTracked {
            chain: chain.to_string(),
        });
    }
    Ok(table)
}

fn solana_program(chain: &str, value: Option<&String>, default: &str) -> Result<String, ConfigError> {
    let program = value.map_or(default, String::as_str);
    match bs58::decode(program).into_vec() {
        Ok(bytes) if bytes.len() == 32 => Ok(program.to_string()),
        _ => Err(ConfigError::InvalidAddress {
            chain: chain.to_string(),
            address: program.to_string(),
        }),
    }
}

impl RawWatcher {
    pub fn validate(&self) -> Result<WatcherParams, ConfigError> {
        let chain = self.chain.as_str();
        let chain_id = self
            .chain_id
            .or_else(|| ChainId::from_name(chain))
            .ok_or_else(|| ConfigError::UnknownChainId {
                chain: chain.to_string(),
            })?;
        if self.size_blocks == 0 {
            return Err(ConfigError::ZeroPageSize {
                chain: chain.to_string(),
            });
        }

        let source = match &self.source {
            RawSource::Evm { contracts } => SourceParams::Evm {
                methods: method_table(chain, contracts)?,
            },
            RawSource::Ankr { blockchain, contracts } => SourceParams::Ankr {
                blockchain: blockchain.clone(),
                methods: method_table(chain, contracts)?,
            },
            RawSource::Solana {
                token_bridge,
                core_bridge,
            } => SourceParams::Solana {
                token_bridge: solana_program(chain, token_bridge.as_ref(), TOKEN_BRIDGE_PROGRAM)?,
                core_bridge: solana_program(chain, core_bridge.as_ref(), CORE_BRIDGE_PROGRAM)?,
            },
            RawSource::Aptos {
                module_address,
                functions,
            } => {
                let address = normalize_move_address(module_address).ok_or_else(|| ConfigError::InvalidAddress {
                    chain: chain.to_string(),
                    address: module_address.clone(),
                })?;
                if functions.is_empty() {
                    return Err(ConfigError::NothingTracked {
                        chain: chain.to_string(),
                    });
                }
                SourceParams::Aptos {
                    module: AptosModule {
                        address,
                        functions: functions.clone(),
                    },
                }
            }
            RawSource::Terra {
                fcd_url,
                contract,
                methods,
            } => {
                if contract.trim().is_empty() {
                    return Err(ConfigError::InvalidAddress {
                        chain: chain.to_string(),
                        address: contract.clone(),
                    });
                }
                if methods.is_empty() {
                    return Err(ConfigError::NothingTracked {
                        chain: chain.to_string(),
                    });
                }
                SourceParams::Terra {
                    fcd_url: parse_url(chain, fcd_url)?,
                    contract: contract.clone(),
                    methods: methods.clone(),
                }
            }
        };

        let retry = self
            .retry
            .as_ref()
            .map(|r| RetryPolicy::new(r.attempts, Duration::from_millis(r.delay_ms)))
            .unwrap_or_default();

        Ok(WatcherParams {
            chain: self.chain.clone(),
            chain_id,
            url: parse_url(chain, &self.url)?,
            rate_limit: self.rate_limit,
            size_blocks: self.size_blocks,
            wait: Duration::from_secs(self.wait_seconds),
            initial_block: self.initial_block,
            retry,
            source,
        })
    }
}
