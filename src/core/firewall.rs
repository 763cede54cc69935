//! Firewall rule descriptions and their nftables JSON form
//!
//! curfew owns one table (`inet curfew` by default) with a single `output`
//! chain. Each managed rule carries its name in the nft `comment`, which is
//! how it is found and deleted again; a [`RuleSpec`] that matches both IPv4
//! and IPv6 destinations becomes two nft rules with the same comment.
//!
//! Allow rules are inserted at the head of the chain and block rules are
//! appended, so every accept precedes every drop regardless of the order in
//! which they were created.
//!
//! # Example
//!
//! ```
//! use curfew::core::firewall::{Action, Protocol, RuleSpec, nft_rule_commands};
//!
//! let spec = RuleSpec {
//!     name: "Curfew-DoT-Lock".to_string(),
//!     action: Action::Block,
//!     protocol: Protocol::Tcp,
//!     remote: Vec::new(),
//!     remote_port: Some(853),
//! };
//! let commands = nft_rule_commands("curfew", &spec);
//! assert_eq!(commands.len(), 1);
//! assert_eq!(commands[0]["add"]["rule"]["comment"], "Curfew-DoT-Lock");
//! ```

use crate::core::error::Result;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;

/// Chain every managed rule lives in
pub const CHAIN: &str = "output";

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Protocol {
    #[strum(serialize = "any")]
    Any,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Action {
    #[strum(serialize = "allow")]
    Allow,
    #[strum(serialize = "block")]
    Block,
}

impl Action {
    /// nftables verdict for this action
    pub const fn verdict(self) -> &'static str {
        match self {
            Action::Allow => "accept",
            Action::Block => "drop",
        }
    }
}

/// One named outbound rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub action: Action,
    pub protocol: Protocol,
    /// Destination addresses; empty matches every destination
    pub remote: Vec<IpNetwork>,
    pub remote_port: Option<u16>,
}

/// Names of every rule curfew manages, derived from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleNames {
    prefix: String,
}

impl RuleNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn dns_lock(&self) -> String {
        format!("{}-DNS-Lock", self.prefix)
    }

    pub fn dot_lock(&self) -> String {
        format!("{}-DoT-Lock", self.prefix)
    }

    pub fn allowlist_block_all(&self) -> String {
        format!("{}-Allowlist-BlockAll", self.prefix)
    }

    pub fn allowlist_allow(&self, suffix: &str) -> String {
        format!("{}-Allowlist-Allow-{suffix}", self.prefix)
    }

    /// Every allowlist rule name, block-all first.
    pub fn allowlist_all(&self) -> [String; 4] {
        [
            self.allowlist_block_all(),
            self.allowlist_allow("0"),
            self.allowlist_allow("local"),
            self.allowlist_allow("loopback"),
        ]
    }

    pub fn is_allowlist(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-Allowlist-", self.prefix))
    }

    pub fn is_dns_lock(&self, name: &str) -> bool {
        name == self.dns_lock() || name == self.dot_lock()
    }
}

/// Operations on the OS rule table. Rule identity is the name.
pub trait RuleBackend: Send + Sync {
    /// Deletes every rule called `name` and returns how many were removed.
    /// A missing rule (or table) is not an error.
    fn delete_rule(&self, name: &str) -> impl Future<Output = Result<usize>> + Send;

    /// Creates `spec` without looking for an existing rule of that name.
    fn create_rule(&self, spec: &RuleSpec) -> impl Future<Output = Result<()>> + Send;

    fn rule_exists(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Names of every managed rule, one entry per name.
    fn rule_names(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Creates the table and chain if needed. `add` is a no-op for existing objects.
pub fn nft_setup_commands(table: &str) -> Vec<Value> {
    vec![
        json!({ "add": { "table": { "family": "inet", "name": table } } }),
        json!({
            "add": {
                "chain": {
                    "family": "inet",
                    "table": table,
                    "name": CHAIN,
                    "type": "filter",
                    "hook": "output",
                    "prio": 0,
                    "policy": "accept"
                }
            }
        }),
    ]
}

fn meta_match(key: &str, value: impl Serialize) -> Value {
    json!({
        "match": {
            "left": { "meta": { "key": key } },
            "op": "==",
            "right": value
        }
    })
}

fn payload_match(protocol: &str, field: &str, value: impl Serialize) -> Value {
    json!({
        "match": {
            "left": { "payload": { "protocol": protocol, "field": field } },
            "op": "==",
            "right": value
        }
    })
}

fn address_value(net: &IpNetwork) -> Value {
    if net.prefix() == max_prefix(net) {
        json!(net.ip().to_string())
    } else {
        json!({ "prefix": { "addr": net.network().to_string(), "len": net.prefix() } })
    }
}

fn max_prefix(net: &IpNetwork) -> u8 {
    match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

fn address_set(nets: &[&IpNetwork]) -> Value {
    match nets {
        [single] => address_value(single),
        _ => {
            let elements: Vec<Value> = nets.iter().map(|n| address_value(n)).collect();
            json!({ "set": elements })
        }
    }
}

fn rule_command(table: &str, spec: &RuleSpec, expr: Vec<Value>) -> Value {
    let rule = json!({
        "rule": {
            "family": "inet",
            "table": table,
            "chain": CHAIN,
            "expr": expr,
            "comment": spec.name
        }
    });
    match spec.action {
        Action::Allow => json!({ "insert": rule }),
        Action::Block => json!({ "add": rule }),
    }
}

/// Protocol and port expressions shared by both address families.
fn transport_exprs(spec: &RuleSpec) -> Vec<Value> {
    let mut expr = Vec::with_capacity(2);
    match (spec.protocol, spec.remote_port) {
        (Protocol::Any, None) => {}
        (Protocol::Any, Some(port)) => {
            expr.push(meta_match("l4proto", json!({ "set": ["tcp", "udp"] })));
            expr.push(payload_match("th", "dport", port));
        }
        (proto, None) => {
            let proto: &str = proto.as_ref();
            expr.push(meta_match("l4proto", proto));
        }
        (proto, Some(port)) => {
            let proto: &str = proto.as_ref();
            expr.push(meta_match("l4proto", proto));
            expr.push(payload_match(proto, "dport", port));
        }
    }
    expr
}

/// nft commands that create `spec`: one per address family it touches.
pub fn nft_rule_commands(table: &str, spec: &RuleSpec) -> Vec<Value> {
    let transport = transport_exprs(spec);
    let mut verdict = serde_json::Map::new();
    verdict.insert(spec.action.verdict().to_string(), Value::Null);
    let verdict = Value::Object(verdict);

    if spec.remote.is_empty() {
        let mut expr = transport;
        expr.push(verdict);
        return vec![rule_command(table, spec, expr)];
    }

    let v4: Vec<&IpNetwork> = spec.remote.iter().filter(|n| n.is_ipv4()).collect();
    let v6: Vec<&IpNetwork> = spec.remote.iter().filter(|n| n.is_ipv6()).collect();

    [("ip", v4), ("ip6", v6)]
        .into_iter()
        .filter(|(_, nets)| !nets.is_empty())
        .map(|(family, nets)| {
            let mut expr = vec![payload_match(family, "daddr", address_set(&nets))];
            expr.extend(transport.iter().cloned());
            expr.push(verdict.clone());
            rule_command(table, spec, expr)
        })
        .collect()
}

pub fn nft_delete_command(table: &str, handle: u64) -> Value {
    json!({
        "delete": {
            "rule": { "family": "inet", "table": table, "chain": CHAIN, "handle": handle }
        }
    })
}

pub fn nft_batch(commands: Vec<Value>) -> Value {
    json!({ "nftables": commands })
}

/// `(comment, handle)` of every rule in a `nft --json -a list chain` listing.
pub fn listed_rules(listing: &Value) -> Vec<(String, u64)> {
    listing
        .get("nftables")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("rule"))
                .filter_map(|rule| {
                    let comment = rule.get("comment")?.as_str()?;
                    let handle = rule.get("handle")?.as_u64()?;
                    Some((comment.to_string(), handle))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn spec(action: Action, remote: Vec<IpNetwork>) -> RuleSpec {
        RuleSpec {
            name: "Curfew-Test".to_string(),
            action,
            protocol: Protocol::Any,
            remote,
            remote_port: None,
        }
    }

    #[test]
    fn test_rule_names() {
        let names = RuleNames::new("Curfew");
        assert_eq!(names.dns_lock(), "Curfew-DNS-Lock");
        assert_eq!(names.dot_lock(), "Curfew-DoT-Lock");
        assert_eq!(names.allowlist_block_all(), "Curfew-Allowlist-BlockAll");
        assert_eq!(names.allowlist_allow("0"), "Curfew-Allowlist-Allow-0");
        assert!(names.is_allowlist("Curfew-Allowlist-Allow-local"));
        assert!(!names.is_allowlist("Curfew-DNS-Lock"));
        assert!(names.is_dns_lock("Curfew-DoT-Lock"));
    }

    #[test]
    fn test_block_all_is_appended_without_matches() {
        let commands = nft_rule_commands("curfew", &spec(Action::Block, Vec::new()));
        assert_eq!(commands.len(), 1);
        let rule = &commands[0]["add"]["rule"];
        assert_eq!(rule["chain"], "output");
        assert_eq!(rule["expr"], json!([{ "drop": null }]));
    }

    #[test]
    fn test_allow_is_inserted() {
        let commands = nft_rule_commands("curfew", &spec(Action::Allow, vec![net("1.2.3.4/32")]));
        assert!(commands[0].get("insert").is_some());
        assert_eq!(
            commands[0]["insert"]["rule"]["expr"][0]["match"]["right"],
            "1.2.3.4"
        );
    }

    #[test]
    fn test_mixed_families_split() {
        let commands = nft_rule_commands(
            "curfew",
            &spec(
                Action::Block,
                vec![net("8.8.8.8/32"), net("2001:4860:4860::8888/128"), net("1.1.1.1/32")],
            ),
        );
        assert_eq!(commands.len(), 2);
        let v4 = &commands[0]["add"]["rule"]["expr"][0]["match"];
        assert_eq!(v4["left"]["payload"]["protocol"], "ip");
        assert_eq!(v4["right"], json!({ "set": ["8.8.8.8", "1.1.1.1"] }));
        let v6 = &commands[1]["add"]["rule"]["expr"][0]["match"];
        assert_eq!(v6["left"]["payload"]["protocol"], "ip6");
    }

    #[test]
    fn test_subnet_uses_prefix() {
        let commands = nft_rule_commands("curfew", &spec(Action::Allow, vec![net("192.168.1.7/24")]));
        assert_eq!(
            commands[0]["insert"]["rule"]["expr"][0]["match"]["right"],
            json!({ "prefix": { "addr": "192.168.1.0", "len": 24 } })
        );
    }

    #[test]
    fn test_udp_without_port_matches_protocol_name() {
        let mut udp = spec(Action::Block, Vec::new());
        udp.protocol = Protocol::Udp;
        let expr = &nft_rule_commands("curfew", &udp)[0]["add"]["rule"]["expr"];
        assert_eq!(expr[0]["match"]["left"]["meta"]["key"], "l4proto");
        assert_eq!(expr[0]["match"]["right"], "udp");
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
    }

    #[test]
    fn test_tcp_port_match() {
        let mut dot = spec(Action::Block, Vec::new());
        dot.protocol = Protocol::Tcp;
        dot.remote_port = Some(853);
        let expr = &nft_rule_commands("curfew", &dot)[0]["add"]["rule"]["expr"];
        assert_eq!(expr[0]["match"]["right"], "tcp");
        assert_eq!(expr[1]["match"]["left"]["payload"]["field"], "dport");
        assert_eq!(expr[1]["match"]["right"], 853);
        assert_eq!(expr[2], json!({ "drop": null }));
    }

    #[test]
    fn test_listed_rules() {
        let listing = json!({
            "nftables": [
                { "metainfo": { "json_schema_version": 1 } },
                { "chain": { "family": "inet", "table": "curfew", "name": "output", "handle": 1 } },
                { "rule": { "family": "inet", "table": "curfew", "chain": "output", "handle": 4, "comment": "Curfew-DNS-Lock", "expr": [] } },
                { "rule": { "family": "inet", "table": "curfew", "chain": "output", "handle": 5, "expr": [] } },
                { "rule": { "family": "inet", "table": "curfew", "chain": "output", "handle": 6, "comment": "Curfew-DNS-Lock", "expr": [] } }
            ]
        });
        assert_eq!(
            listed_rules(&listing),
            vec![
                ("Curfew-DNS-Lock".to_string(), 4),
                ("Curfew-DNS-Lock".to_string(), 6)
            ]
        );
        assert!(listed_rules(&json!({})).is_empty());
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(Action::Allow.to_string(), "allow");
    }
}
