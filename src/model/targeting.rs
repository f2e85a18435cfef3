// src/model/targeting.rs

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize};

/// **包含/排除集合**
///
/// 四个集合都为空时不做限制。
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ExcludeInclude {
    pub include_or: HashSet<String>,
    pub exclude_or: HashSet<String>,
    pub include_and: HashSet<String>,
    pub exclude_and: HashSet<String>,
}

impl ExcludeInclude {
    pub fn is_empty(&self) -> bool {
        self.include_or.is_empty()
            && self.exclude_or.is_empty()
            && self.include_and.is_empty()
            && self.exclude_and.is_empty()
    }

    /// 判断顺序不可调换：exclude_and → include_and → exclude_or → include_or
    pub fn validate<S: AsRef<str>>(&self, values: &[S]) -> bool {
        if self.is_empty() {
            return true;
        }
        let present: HashSet<&str> = values.iter().map(AsRef::as_ref).collect();
        let has = |value: &String| present.contains(value.as_str());

        if !self.exclude_and.is_empty() && self.exclude_and.iter().all(has) {
            return false;
        }
        if !self.include_and.is_empty() && !self.include_and.iter().all(has) {
            return false;
        }
        if !self.exclude_or.is_empty() && self.exclude_or.iter().any(has) {
            return false;
        }
        if !self.include_or.is_empty() && !self.include_or.iter().any(has) {
            return false;
        }
        true
    }

    /// 下层非空的子集合整体替换上层的
    pub fn overlay(&mut self, lower: ExcludeInclude) {
        replace_if_set(&mut self.include_or, lower.include_or);
        replace_if_set(&mut self.exclude_or, lower.exclude_or);
        replace_if_set(&mut self.include_and, lower.include_and);
        replace_if_set(&mut self.exclude_and, lower.exclude_and);
    }
}

fn replace_if_set<T>(current: &mut HashSet<T>, lower: HashSet<T>) {
    if !lower.is_empty() {
        *current = lower;
    }
}

/// IP 段定向，支持 CIDR 及单个地址
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ExcludeIncludeIp {
    #[serde(deserialize_with = "deserialize_networks")]
    pub include: Vec<IpNet>,
    #[serde(deserialize_with = "deserialize_networks")]
    pub exclude: Vec<IpNet>,
}

impl ExcludeIncludeIp {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// 有定向时，无法解析的请求 IP 一律不通过
    pub fn validate(&self, ip: Option<&str>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(addr) = ip.and_then(|ip| ip.trim().parse::<IpAddr>().ok()) else {
            return false;
        };
        let addr = addr.to_canonical();

        if self.exclude.iter().any(|net| net.contains(&addr)) {
            return false;
        }
        if !self.include.is_empty() && !self.include.iter().any(|net| net.contains(&addr)) {
            return false;
        }
        true
    }

    pub fn overlay(&mut self, lower: ExcludeIncludeIp) {
        if !lower.include.is_empty() {
            self.include = lower.include;
        }
        if !lower.exclude.is_empty() {
            self.exclude = lower.exclude;
        }
    }
}

pub fn parse_network(value: &str) -> Option<IpNet> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return Some(net);
    }
    let addr = value.parse::<IpAddr>().ok()?;
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, prefix).ok()
}

fn deserialize_networks<'de, D>(deserializer: D) -> Result<Vec<IpNet>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    raw.iter()
        .map(|value| {
            parse_network(value)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid network `{value}`")))
        })
        .collect()
}

/// **有效定向**，八个维度彼此独立
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Targeting {
    pub bundle: ExcludeInclude,
    pub audience: ExcludeInclude,
    pub bapp: ExcludeInclude,
    pub country: ExcludeInclude,
    pub region: ExcludeInclude,
    pub city: ExcludeInclude,
    pub network: ExcludeInclude,
    pub ip: ExcludeIncludeIp,
}

impl Targeting {
    pub fn is_empty(&self) -> bool {
        self.bundle.is_empty()
            && self.audience.is_empty()
            && self.bapp.is_empty()
            && self.country.is_empty()
            && self.region.is_empty()
            && self.city.is_empty()
            && self.network.is_empty()
            && self.ip.is_empty()
    }

    /// 以下层（更靠近创意）的值覆盖当前值
    pub fn overlay(&mut self, lower: Targeting) {
        self.bundle.overlay(lower.bundle);
        self.audience.overlay(lower.audience);
        self.bapp.overlay(lower.bapp);
        self.country.overlay(lower.country);
        self.region.overlay(lower.region);
        self.city.overlay(lower.city);
        self.network.overlay(lower.network);
        self.ip.overlay(lower.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn ips(include: &[&str], exclude: &[&str]) -> ExcludeIncludeIp {
        ExcludeIncludeIp {
            include: include.iter().filter_map(|v| parse_network(v)).collect(),
            exclude: exclude.iter().filter_map(|v| parse_network(v)).collect(),
        }
    }

    #[test]
    fn empty_dimension_accepts_anything() {
        let rule = ExcludeInclude::default();
        assert!(rule.validate::<&str>(&[]));
        assert!(rule.validate(&["US", "DE"]));
    }

    #[test]
    fn exclude_or_wins_over_include_or() {
        let rule = ExcludeInclude {
            include_or: set(&["A"]),
            exclude_or: set(&["A"]),
            ..Default::default()
        };
        assert!(!rule.validate(&["A"]));
    }

    #[test]
    fn include_or_needs_one_match() {
        let rule = ExcludeInclude {
            include_or: set(&["US", "CA"]),
            ..Default::default()
        };
        assert!(rule.validate(&["CA"]));
        assert!(!rule.validate(&["MX"]));
        assert!(!rule.validate::<&str>(&[]));
    }

    #[test]
    fn include_and_needs_every_value() {
        let rule = ExcludeInclude {
            include_and: set(&["sports", "news"]),
            ..Default::default()
        };
        assert!(rule.validate(&["news", "sports", "music"]));
        assert!(!rule.validate(&["news"]));
    }

    #[test]
    fn exclude_and_rejects_only_full_match() {
        let rule = ExcludeInclude {
            exclude_and: set(&["a", "b"]),
            ..Default::default()
        };
        assert!(rule.validate(&["a"]));
        assert!(!rule.validate(&["b", "a"]));
    }

    #[test]
    fn exclude_and_checked_before_include_or() {
        let rule = ExcludeInclude {
            include_or: set(&["a"]),
            exclude_and: set(&["a", "b"]),
            ..Default::default()
        };
        assert!(!rule.validate(&["a", "b"]));
        assert!(rule.validate(&["a"]));
    }

    #[test]
    fn ip_included_network_matches() {
        let rule = ips(&["10.0.0.0/24"], &[]);
        assert!(rule.validate(Some("10.0.0.5")));
        assert!(!rule.validate(Some("10.0.1.5")));
    }

    #[test]
    fn ip_exclude_wins_regardless_of_include() {
        assert!(!ips(&[], &["10.0.0.0/24"]).validate(Some("10.0.0.5")));
        assert!(!ips(&["10.0.0.0/24"], &["10.0.0.0/24"]).validate(Some("10.0.0.5")));
        assert!(ips(&[], &["10.0.0.0/24"]).validate(Some("192.168.1.1")));
    }

    #[test]
    fn ip_unparsable_rejected_only_with_rules() {
        assert!(ExcludeIncludeIp::default().validate(Some("not-an-ip")));
        assert!(ExcludeIncludeIp::default().validate(None));
        assert!(!ips(&[], &["10.0.0.0/24"]).validate(Some("not-an-ip")));
        assert!(!ips(&["10.0.0.0/24"], &[]).validate(None));
    }

    #[test]
    fn ip_single_address_and_mapped_v6() {
        let rule = ips(&["10.0.0.5"], &[]);
        assert!(rule.validate(Some("10.0.0.5")));
        assert!(rule.validate(Some("::ffff:10.0.0.5")));
        assert!(!rule.validate(Some("10.0.0.6")));
    }

    #[test]
    fn deserializes_stored_json() {
        let json = r#"{
            "country": {"include_or": ["US"], "exclude_or": ["CA"]},
            "ip": {"include": ["10.0.0.0/8", "192.168.1.1"]}
        }"#;
        let targeting: Targeting = serde_json::from_str(json).expect("valid targeting json");
        assert_eq!(targeting.country.include_or, set(&["US"]));
        assert_eq!(targeting.ip.include.len(), 2);
        assert!(targeting.region.is_empty());
    }

    #[test]
    fn rejects_invalid_network() {
        let json = r#"{"ip": {"exclude": ["10.0.0.300/8"]}}"#;
        assert!(serde_json::from_str::<Targeting>(json).is_err());
    }

    #[test]
    fn overlay_replaces_only_non_empty_sub_fields() {
        let mut upper = Targeting::default();
        upper.country.include_or = set(&["US"]);
        upper.country.exclude_or = set(&["CA"]);

        let mut lower = Targeting::default();
        lower.country.include_or = set(&["DE"]);

        upper.overlay(lower);
        assert_eq!(upper.country.include_or, set(&["DE"]));
        assert_eq!(upper.country.exclude_or, set(&["CA"]));
    }

    fn arb_set() -> impl Strategy<Value = HashSet<String>> {
        prop::collection::hash_set("[a-e]", 0..4)
    }

    fn arb_rule() -> impl Strategy<Value = ExcludeInclude> {
        (arb_set(), arb_set(), arb_set(), arb_set()).prop_map(
            |(include_or, exclude_or, include_and, exclude_and)| ExcludeInclude {
                include_or,
                exclude_or,
                include_and,
                exclude_and,
            },
        )
    }

    proptest! {
        #[test]
        fn lower_non_empty_sub_field_always_wins(upper in arb_rule(), lower in arb_rule()) {
            let mut merged = upper.clone();
            merged.overlay(lower.clone());
            if !lower.include_or.is_empty() {
                prop_assert_eq!(&merged.include_or, &lower.include_or);
            } else {
                prop_assert_eq!(&merged.include_or, &upper.include_or);
            }
            if !lower.exclude_and.is_empty() {
                prop_assert_eq!(&merged.exclude_and, &lower.exclude_and);
            } else {
                prop_assert_eq!(&merged.exclude_and, &upper.exclude_and);
            }
        }

        #[test]
        fn matching_exclude_or_always_rejects(rule in arb_rule(), values in prop::collection::vec("[a-e]", 0..5)) {
            let hit = rule.exclude_or.iter().any(|v| values.contains(v));
            if hit {
                prop_assert!(!rule.validate(&values));
            }
        }
    }
}
