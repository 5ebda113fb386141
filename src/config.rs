// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration
//!
//! The values here come from the enclave manifest, which is parsed
//! elsewhere. [`Config`] can be used with any serde deserializer.

use serde::Deserialize;

const fn default_thread_num() -> usize {
    4
}

/// The thread configuration of an enclave
///
/// # Examples
///
/// ```
/// extern crate toml;
/// use sgx_urts::Config;
/// const CONFIG: &str = r#"
/// thread_num = 8
/// enable_stats = true
/// "#;
///
/// let config: Config = toml::from_str(CONFIG).unwrap();
/// assert_eq!(config.thread_num, 8);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The number of TCS pages in the enclave
    ///
    /// This is the maximum number of threads that can execute enclave code
    /// at the same time.
    #[serde(default = "default_thread_num")]
    pub thread_num: usize,

    /// Collect and print per-thread and per-process SGX statistics
    #[serde(default)]
    pub enable_stats: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_num: default_thread_num(),
            enable_stats: false,
        }
    }
}
