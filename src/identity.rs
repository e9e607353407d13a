//! Identity key registry.
//!
//! Most vendors submit records without a stable hostdb id, so a natural key
//! inside the payload decides which stored record an incoming one replaces.
//! Each rule pairs a record-type matcher with the payload property holding
//! that key. Types without a rule fall back to hostname equality.

use crate::record::{scalar_text, Record};

/// Selects record types by exact name or by substring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeMatcher {
    Exact(String),
    Contains(String),
}

impl TypeMatcher {
    pub fn exact(name: &str) -> Self {
        TypeMatcher::Exact(name.to_string())
    }
    pub fn contains(fragment: &str) -> Self {
        TypeMatcher::Contains(fragment.to_string())
    }
    pub fn matches(&self, record_type: &str) -> bool {
        match self {
            TypeMatcher::Exact(name) => record_type == name,
            TypeMatcher::Contains(fragment) => record_type.contains(fragment.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityRule {
    /// Top-level property of `data`.
    Property(String),
    /// Last resort: exact hostname equality.
    Hostname,
}

impl IdentityRule {
    /// The identity value of one record under this rule; blank values count as none.
    pub fn extract(&self, record: &Record) -> Option<String> {
        let value = match self {
            IdentityRule::Property(name) => record.data.get(name).and_then(scalar_text),
            IdentityRule::Hostname => Some(record.hostname.clone()),
        };
        value.filter(|v| !v.is_empty())
    }

    pub fn same_identity(&self, incoming: &Record, candidate: &Record) -> bool {
        match (self.extract(incoming), self.extract(candidate)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    rules: Vec<(TypeMatcher, IdentityRule)>,
}

const AWS: &[(&str, &str)] = &[
    ("aws-bucket", "Name"),
    ("aws-database", "DbiResourceId"),
    ("aws-directconnect", "VirtualInterfaceId"),
    ("aws-hostedzone", "Id"),
    ("aws-image", "ImageId"),
    ("aws-keypair", "KeyName"),
    ("aws-securitygroup", "GroupId"),
    ("aws-subnet", "SubnetId"),
    ("aws-vpc", "VpcId"),
];

const ONEVIEW: &[&str] = &[
    "enclosure",
    "enclosure_group",
    "ethernet_network",
    "fc_network",
    "fcoe_network",
    "interconnect",
    "interconnect_type",
    "logical_enclosure",
    "logical_interconnect",
    "logical_interconnect_group",
    "network_set",
    "scope",
    "server_hardware",
    "server_hardware_type",
    "server_profile",
    "server_profile_template",
    "storage_pool",
    "storage_system",
    "storage_volume",
    "storage_volume_attachment",
    "storage_volume_template",
    "task",
    "uplink_set",
];

const UCS_BY_DN: &[&str] = &[
    "cpu",
    "fabric_interconnect",
    "memory",
    "pci",
    "storage",
    "vhba",
    "vic",
    "vnic",
];

const UCS_BY_SERIAL: &[&str] = &["disk", "psu"];

impl Default for IdentityRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for (record_type, property) in AWS {
            registry.register(TypeMatcher::exact(record_type), property);
        }
        for kind in ONEVIEW {
            registry.register(TypeMatcher::exact(&format!("oneview-{kind}")), "uri");
        }
        registry.register(TypeMatcher::exact("openstack"), "id");
        for kind in UCS_BY_DN {
            registry.register(TypeMatcher::exact(&format!("ucs-{kind}")), "dn");
        }
        for kind in UCS_BY_SERIAL {
            registry.register(TypeMatcher::exact(&format!("ucs-{kind}")), "serial");
        }
        registry.register(TypeMatcher::exact("vrops-vmware"), "resourceId");
        registry
    }
}

impl IdentityRegistry {
    /// A registry with no rules: every type falls back to hostname.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Adds a rule; earlier registrations take precedence.
    pub fn register(&mut self, matcher: TypeMatcher, property: &str) -> &mut Self {
        self.rules.push((matcher, IdentityRule::Property(property.to_string())));
        self
    }

    pub fn rule_for(&self, record_type: &str) -> IdentityRule {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.matches(record_type))
            .map(|(_, rule)| rule.clone())
            .unwrap_or(IdentityRule::Hostname)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
