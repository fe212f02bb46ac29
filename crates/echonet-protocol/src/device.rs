use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A 3-byte ECHONET Object identifier: class group, class, instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Eoj {
    pub class_group: u8,
    pub class: u8,
    pub instance: u8,
}

impl Eoj {
    pub const NODE_PROFILE: Eoj = Eoj {
        class_group: 0x0E,
        class: 0xF0,
        instance: 0x01,
    };

    pub const fn new(class_group: u8, class: u8, instance: u8) -> Self {
        Eoj {
            class_group,
            class,
            instance,
        }
    }

    pub const fn to_bytes(self) -> [u8; 3] {
        [self.class_group, self.class, self.instance]
    }

    pub const fn from_bytes(bytes: [u8; 3]) -> Self {
        Eoj::new(bytes[0], bytes[1], bytes[2])
    }
}

impl fmt::Display for Eoj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}",
            self.class_group, self.class, self.instance
        )
    }
}

/// Parse error for [`Eoj::from_str`].
#[derive(Debug, thiserror::Error)]
#[error("invalid EOJ hex string: {0:?}")]
pub struct EojParseError(String);

impl FromStr for Eoj {
    type Err = EojParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 6 {
            return Err(EojParseError(s.to_owned()));
        }
        let mut bytes = [0u8; 3];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| EojParseError(s.to_owned()))?;
        }
        Ok(Eoj::from_bytes(bytes))
    }
}

/// An IP address paired with the node profile EOJ it advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub ip: IpAddr,
    pub node_profile: Eoj,
}

impl NodeId {
    pub fn new(ip: IpAddr) -> Self {
        NodeId {
            ip,
            node_profile: Eoj::NODE_PROFILE,
        }
    }
}

/// `(NodeID, EOJ)` — the registry's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub node: NodeId,
    pub eoj: Eoj,
}

impl DeviceKey {
    pub fn new(ip: IpAddr, eoj: Eoj) -> Self {
        DeviceKey {
            node: NodeId::new(ip),
            eoj,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.node.ip
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.node.ip, self.eoj)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid device key string: {0:?}")]
pub struct DeviceKeyParseError(String);

impl FromStr for DeviceKey {
    type Err = DeviceKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(' ');
        let ip_str = parts.next().ok_or_else(|| DeviceKeyParseError(s.to_owned()))?;
        let eoj_str = parts.next().ok_or_else(|| DeviceKeyParseError(s.to_owned()))?;
        if parts.next().is_some() {
            return Err(DeviceKeyParseError(s.to_owned()));
        }
        let ip: IpAddr = ip_str.parse().map_err(|_| DeviceKeyParseError(s.to_owned()))?;
        let eoj: Eoj = eoj_str.parse().map_err(|_| DeviceKeyParseError(s.to_owned()))?;
        Ok(DeviceKey::new(ip, eoj))
    }
}

impl serde::Serialize for DeviceKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for DeviceKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
