//! Per-service API-key registry.
//!
//! Keys are 128-bit random tokens, hex-encoded. A key is minted the first
//! time its service is observed and is never rotated while the supervisor
//! lives, so config reloads do not invalidate credentials already handed
//! to running services.

use std::collections::HashMap;

use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{NsrvmError, Result};

pub struct ApiKeyRegistry {
    keys: HashMap<String, String>,
    rng: SystemRandom,
}

impl Default for ApiKeyRegistry {
    fn default() -> Self {
        Self {
            keys: HashMap::new(),
            rng: SystemRandom::new(),
        }
    }
}

impl ApiKeyRegistry {
    /// Return the key for `name`, minting one on first sight.
    pub fn mint(&mut self, name: &str) -> Result<&str> {
        if !self.keys.contains_key(name) {
            let mut bytes = [0u8; 16];
            self.rng
                .fill(&mut bytes)
                .map_err(|_| NsrvmError::TokenGen)?;
            self.keys.insert(name.to_string(), hex::encode(bytes));
        }
        match self.keys.get(name) {
            Some(key) => Ok(key),
            None => Err(NsrvmError::TokenGen),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.keys.get(name).map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }
}
