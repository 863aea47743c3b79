use crate::CloudError;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A fixed IP assignment on a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: IpAddr,
}

/// A cloud port, as far as the agent cares about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    pub mac_address: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

impl Port {
    /// MAC address as raw bytes
    pub fn mac_bytes(&self) -> Result<Vec<u8>, CloudError> {
        let bytes = self
            .mac_address
            .split(':')
            .map(|octet| u8::from_str_radix(octet, 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| CloudError::Invalid {
                field: "mac_address",
                value: self.mac_address.clone(),
            })?;

        if bytes.len() != 6 {
            return Err(CloudError::Invalid {
                field: "mac_address",
                value: self.mac_address.clone(),
            });
        }

        Ok(bytes)
    }
}

/// A cloud subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub cidr: String,
}

impl Subnet {
    /// Prefix length of the subnet CIDR
    pub fn prefix_len(&self) -> Result<u8, CloudError> {
        self.cidr
            .parse::<IpNetwork>()
            .map(|net| net.prefix())
            .map_err(|_| CloudError::Invalid {
                field: "cidr",
                value: self.cidr.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_bytes() {
        let port = Port {
            id: "p1".to_string(),
            network_id: "n1".to_string(),
            mac_address: "fa:16:3e:01:02:0a".to_string(),
            fixed_ips: vec![],
        };
        assert_eq!(
            port.mac_bytes().unwrap(),
            vec![0xfa, 0x16, 0x3e, 0x01, 0x02, 0x0a]
        );

        let bad = Port {
            mac_address: "fa:16:3e".to_string(),
            ..port
        };
        assert!(bad.mac_bytes().is_err());
    }

    #[test]
    fn test_subnet_prefix() {
        let subnet = Subnet {
            id: "s1".to_string(),
            cidr: "10.180.0.0/22".to_string(),
        };
        assert_eq!(subnet.prefix_len().unwrap(), 22);

        let v6 = Subnet {
            id: "s2".to_string(),
            cidr: "fd00::/64".to_string(),
        };
        assert_eq!(v6.prefix_len().unwrap(), 64);

        let bad = Subnet {
            id: "s3".to_string(),
            cidr: "not-a-cidr".to_string(),
        };
        assert!(bad.prefix_len().is_err());
    }

    #[test]
    fn test_port_deserialize_neutron_shape() {
        let json = r#"{
            "id": "d5b2a3c4",
            "network_id": "net-a",
            "mac_address": "fa:16:3e:aa:bb:cc",
            "fixed_ips": [{"subnet_id": "sub-a", "ip_address": "10.0.0.5"}],
            "status": "ACTIVE"
        }"#;
        let port: Port = serde_json::from_str(json).unwrap();
        assert_eq!(port.fixed_ips.len(), 1);
        assert_eq!(port.fixed_ips[0].ip_address.to_string(), "10.0.0.5");
    }
}
