/*
* SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
* SPDX-License-Identifier: Apache-2.0
*/
use serde::Deserialize;
use std::sync::OnceLock;
static SETTINGS: OnceLock<Settings> = OnceLock::new();

#[derive(Deserialize)]
pub struct Settings {
    pub bind: BindSettings,
    pub etcd: EtcdSettings,
    pub peers: PeerSettings,
    pub minion_manager: MinionManagerSettings,
}

#[derive(Deserialize)]
pub struct BindSettings {
    pub address: String,
    pub port: u16,
}

#[derive(Deserialize)]
pub struct EtcdSettings {
    pub endpoint: String,
}

/// Base URLs of the peer services the minion manager calls out to.
#[derive(Deserialize)]
pub struct PeerSettings {
    pub conductor_url: String,
    pub scheduler_url: String,
    pub worker_url: String,
}

#[derive(Deserialize)]
pub struct MinionManagerSettings {
    /// Number of minutes in which to refresh minion pools.
    pub minion_pool_default_refresh_period_minutes: i64,
    /// Worker cap for the background taskflow runner.
    pub taskflow_max_workers: usize,
}

fn default_settings() -> Settings {
    Settings {
        bind: BindSettings {
            address: String::from("0.0.0.0"),
            port: 41276,
        },
        etcd: EtcdSettings {
            endpoint: String::from("localhost:2379"),
        },
        peers: PeerSettings {
            conductor_url: String::from("http://localhost:41280"),
            scheduler_url: String::from("http://localhost:41281"),
            worker_url: String::from("http://localhost:41282"),
        },
        minion_manager: MinionManagerSettings {
            minion_pool_default_refresh_period_minutes: 10,
            taskflow_max_workers: 25,
        },
    }
}

fn parse_settings_yaml() -> Settings {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("/etc/mariner/minionmanager.yaml"))
        .build();

    match settings {
        Ok(result) => result
            .try_deserialize::<Settings>()
            .unwrap_or_else(|_| default_settings()),
        Err(_) => default_settings(),
    }
}

pub fn get_config() -> &'static Settings {
    SETTINGS.get_or_init(parse_settings_yaml)
}

//Unit Test Cases
#[cfg(test)]
mod tests {
    use super::*;

    // Test default values when no settings file is provided
    #[tokio::test]
    async fn test_parse_settings_yaml_default_values() {
        let settings = parse_settings_yaml();
        assert_eq!(settings.etcd.endpoint, "localhost:2379");
        assert_eq!(
            settings
                .minion_manager
                .minion_pool_default_refresh_period_minutes,
            10
        );
        assert_eq!(settings.minion_manager.taskflow_max_workers, 25);
    }

    // Test static behavior of `get_config`
    #[tokio::test]
    async fn test_get_config_static_behavior() {
        let config1 = get_config();
        let config2 = get_config();
        assert!(std::ptr::eq(config1, config2));
    }

    // Test handling of a settings file with invalid peer URLs
    #[tokio::test]
    async fn test_parse_settings_yaml_peer_urls() {
        let settings = parse_settings_yaml();
        assert!(settings.peers.conductor_url.starts_with("http://")
            || settings.peers.conductor_url.starts_with("https://"));
        assert!(settings.peers.scheduler_url.starts_with("http://")
            || settings.peers.scheduler_url.starts_with("https://"));
        assert!(settings.peers.worker_url.starts_with("http://")
            || settings.peers.worker_url.starts_with("https://"));
    }

    // Test concurrent access to `get_config`
    #[tokio::test]
    async fn test_get_config_concurrent_access() {
        use std::thread;

        let handles: Vec<_> = (0..10)
            .map(|_| {
                thread::spawn(|| {
                    let config = get_config();
                    assert_eq!(config.minion_manager.taskflow_max_workers, 25);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    // Test handling of missing bind address
    #[tokio::test]
    async fn test_parse_settings_yaml_bind_address() {
        let settings = parse_settings_yaml();
        assert!(settings.bind.address.parse::<std::net::Ipv4Addr>().is_ok());
        assert_ne!(settings.bind.port, 0);
    }
}
