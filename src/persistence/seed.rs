use super::{BrokerConfigRepository, BrokerConnection, InMemoryStore, NewDevice, StoreError};
use crate::config::AppConfig;
use tracing::{info, warn};

/// Fills an empty store from the `[broker]` and `[[devices]]` config sections.
///
/// Devices that collide with an existing row are skipped with a warning.
/// Returns the number of devices registered.
pub async fn seed_store(store: &InMemoryStore, config: &AppConfig) -> Result<usize, StoreError> {
    if let Some(broker) = &config.broker {
        store
            .save(BrokerConnection {
                host: broker.host.trim().to_string(),
                port: broker.port,
                username: broker.username.clone().filter(|u| !u.is_empty()),
                encrypted_password: broker.encrypted_password.clone().filter(|p| !p.is_empty()),
                tls_enabled: broker.tls_enabled,
                client_id: broker.client_id.clone(),
                connected: false,
                last_connected_at: None,
            })
            .await?;
        info!("Seeded broker configuration {}:{}", broker.host, broker.port);
    }

    let mut registered = 0;
    for device in &config.devices {
        let input = NewDevice {
            name: device.name.clone(),
            mac_address: device.mac_address.clone(),
            bus_id: device.bus_id.clone(),
            ip_address: device.ip.clone(),
        };
        match store.register_device(input).await {
            Ok(_) => registered += 1,
            Err(StoreError::Conflict(reason)) => {
                warn!("Skipping device {}: {}", device.bus_id, reason)
            }
            Err(e) => return Err(e),
        }
    }

    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::DeviceRepository;

    #[tokio::test]
    async fn test_seed_skips_duplicates() {
        let config = AppConfig::from_toml_str(
            r#"
            [broker]
            host = "broker.lan"
            username = ""

            [[devices]]
            name = "Sala"
            mac_address = "aa:bb:cc:dd:ee:01"
            bus_id = "tasmota_sala_luz"

            [[devices]]
            name = "Sala copy"
            mac_address = "aa:bb:cc:dd:ee:02"
            bus_id = "tasmota_sala_luz"
            "#,
        )
        .unwrap();

        let store = InMemoryStore::new();
        let registered = seed_store(&store, &config).await.unwrap();
        assert_eq!(registered, 1);
        assert_eq!(store.list().await.unwrap().len(), 1);

        let broker = store.load().await.unwrap().unwrap();
        assert_eq!(broker.endpoint(), "broker.lan:1883");
        assert!(broker.username.is_none());
        assert!(!broker.connected);
    }
}
