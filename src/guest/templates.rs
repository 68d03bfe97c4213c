// src/guest/templates.rs

//! Network configuration files rendered per OS family.
//!
//! Templates are plain text with `{name}` placeholders. A line whose
//! placeholders are not all bound is left out of the output, which is how
//! optional values (gateway, second DNS server, IPv6) drop away.

use std::collections::BTreeMap;

use crate::guest::OsFamily;
use crate::vm::spec::{CloudRole, Ipv4Assignment, Ipv6Assignment, NetworkSpec};

pub const DEBIAN_INTERFACES: &str = "/etc/network/interfaces";
pub const REDHAT_ETH0: &str = "/etc/sysconfig/network-scripts/ifcfg-eth0";
pub const REDHAT_ETH1: &str = "/etc/sysconfig/network-scripts/ifcfg-eth1";
pub const FEDORA_ETH0: &str = "/etc/NetworkManager/system-connections/eth0.nmconnection";
pub const FEDORA_ETH1: &str = "/etc/NetworkManager/system-connections/eth1.nmconnection";
pub const WINDOWS_FIRST_BOOT: &str =
    "/Windows/System32/GroupPolicy/Machine/Scripts/Startup/cloudinit.cmd";

const DEBIAN_ETH0: &str = "# This file describes the network interfaces available on your
# system and how to activate them. For more information, see
# interfaces(5).

# The loopback network interface
auto lo
iface lo inet loopback
    dns-nameservers {dns}

# The primary network interface
auto eth0
iface eth0 inet static
    address {addr}
    netmask {mask}
    gateway {gw}
";

const DEBIAN_ETH0_V6: &str = "
iface eth0 inet6 static
    address {v6_addr}
    netmask {v6_prefix}
    gateway {v6_gw}
";

const DEBIAN_ETH0_ANCHOR: &str = "
iface eth0 inet static
    address {anchor_addr}
    netmask {anchor_mask}
";

const DEBIAN_ETH1: &str = "
# The secondary network interface
auto eth1
iface eth1 inet static
    address {addr}
    netmask {mask}
";

const DEBIAN_ETH2: &str = "
# The VPC network interface
auto eth2
iface eth2 inet static
    address {addr}
    netmask {mask}
";

const REDHAT_IFCFG_ETH0: &str = "DEVICE=eth0
TYPE=Ethernet
BOOTPROTO=none
ONBOOT=yes
IPADDR={addr}
PREFIX={prefix}
GATEWAY={gw}
IPADDR2={anchor_addr}
PREFIX2={anchor_prefix}
DNS1={dns1}
DNS2={dns2}
NM_CONTROLLED=yes
IPV6INIT={v6_init}
IPV6ADDR={v6_addr}/{v6_prefix}
IPV6_DEFAULTGW={v6_gw}
";

const REDHAT_IFCFG_ETH1: &str = "DEVICE=eth1
TYPE=Ethernet
BOOTPROTO=none
ONBOOT=yes
IPADDR={addr}
PREFIX={prefix}
NM_CONTROLLED=yes
IPV6INIT=no
";

const FEDORA_NM_ETH0: &str = "[connection]
id=eth0
type=ethernet
interface-name=eth0
autoconnect-priority={autoconnect_priority}

[ethernet]

[ipv4]
address1={addr}/{prefix}
address2={anchor_addr}/{anchor_prefix}
gateway={gw}
dns={dns_list}
method=manual
";

const FEDORA_NM_V6: &str = "
[ipv6]
address1={v6_addr}/{v6_prefix}
gateway={v6_gw}
dns={v6_dns_list}
method=manual
";

const FEDORA_NM_V6_AUTO: &str = "
[ipv6]
addr-gen-mode=default
method=auto
";

const FEDORA_NM_TAIL: &str = "
[proxy]
";

const FEDORA_NM_ETH1: &str = "[connection]
id=eth1
type=ethernet
interface-name=eth1

[ethernet]

[ipv4]
address1={addr}/{prefix}
method=manual

[ipv6]
method=disabled

[proxy]
";

const WINDOWS_ETH0: &str = "@echo off
echo  ##############################################################################
echo  #                                                                            #
echo  #                            FIRST BOOT SETUP                                #
echo  #                                                                            #
echo  #         Please don't close the window it will closed automatically         #
echo  #                                                                            #
echo  ##############################################################################

REM IPv4 Public
netsh interface ipv4 delete dnsservers \"Ethernet\" all
netsh interface ipv4 reset
netsh interface ipv4 set address \"Ethernet\" static {addr} {mask} {gw}
netsh interface ipv4 add dnsservers \"Ethernet\" {dns1}
netsh interface ipv4 add dnsservers \"Ethernet\" {dns2} index=2
";

const WINDOWS_ETH0_ANCHOR: &str = "
REM IPv4 Anchor
netsh interface ipv4 add address \"Ethernet\" {anchor_addr} {anchor_mask}
";

const WINDOWS_ETH0_V6: &str = "
REM IPv6 Public
netsh interface ipv6 delete dnsservers \"Ethernet\" all
netsh interface ipv6 reset
netsh interface ipv6 set address \"Ethernet\" {v6_addr}/{v6_prefix}
netsh interface ipv6 add route ::/0 \"Ethernet\" {v6_gw}
netsh interface ipv6 add dnsservers \"Ethernet\" {v6_dns1}
netsh interface ipv6 add dnsservers \"Ethernet\" {v6_dns2} index=2
";

const WINDOWS_ETH1: &str = "
REM IPv4 Private
netsh interface ipv4 set address \"Ethernet 2\" static {addr} {mask}
";

/// A rendered configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFile {
    /// Absolute path inside the guest
    pub path: &'static str,

    pub contents: String,

    /// Permission bits to apply after writing, if the family uses them
    pub mode: Option<u32>,
}

/// Placeholder bindings for one render
#[derive(Debug, Default)]
struct Vars(BTreeMap<String, String>);

impl Vars {
    fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    fn set_opt<T: ToString>(&mut self, key: &str, value: Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.set(key, value);
        }
        self
    }

    fn v4(&mut self, prefix: &str, a: &Ipv4Assignment) -> &mut Self {
        self.set(format!("{}addr", prefix), a.address)
            .set(format!("{}mask", prefix), a.netmask)
            .set(format!("{}prefix", prefix), a.prefix());
        if prefix.is_empty() {
            self.set_opt("gw", a.gateway)
                .set_opt("dns1", a.dns1)
                .set_opt("dns2", a.dns2);
            let servers: Vec<String> = [a.dns1, a.dns2]
                .iter()
                .flatten()
                .map(|d| d.to_string())
                .collect();
            if !servers.is_empty() {
                self.set("dns", servers.join(" "));
                self.set("dns_list", format!("{};", servers.join(";")));
            }
        }
        self
    }

    fn v6(&mut self, a: &Ipv6Assignment) -> &mut Self {
        self.set("v6_init", "yes")
            .set("v6_addr", a.address)
            .set("v6_prefix", a.prefix)
            .set_opt("v6_gw", a.gateway)
            .set_opt("v6_dns1", a.dns1)
            .set_opt("v6_dns2", a.dns2);
        let servers: Vec<String> = [a.dns1, a.dns2]
            .iter()
            .flatten()
            .map(|d| d.to_string())
            .collect();
        if !servers.is_empty() {
            self.set("v6_dns_list", format!("{};", servers.join(";")));
        }
        self
    }
}

/// Substitutes placeholders, dropping lines that reference unbound names
fn fill(template: &str, vars: &Vars) -> String {
    let mut out = String::with_capacity(template.len());
    'lines: for line in template.split_inclusive('\n') {
        let mut rendered = String::with_capacity(line.len());
        let mut rest = line;
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            let name = &rest[start + 1..start + len];
            match vars.0.get(name) {
                Some(value) => {
                    rendered.push_str(&rest[..start]);
                    rendered.push_str(value);
                    rest = &rest[start + len + 1..];
                }
                None => continue 'lines,
            }
        }
        rendered.push_str(rest);
        out.push_str(&rendered);
    }
    out
}

/// Renders the network configuration files for a guest.
///
/// A public-role guest gets its public primary (plus anchor and IPv6)
/// on eth0, the private address on eth1 and, for Debian-style guests, the
/// VPC address on eth2. A private-role guest gets only its VPC address on
/// eth0. Returns no files when the spec holds nothing for the role.
pub fn render_network(family: OsFamily, role: CloudRole, spec: &NetworkSpec) -> Vec<NetworkFile> {
    match role {
        CloudRole::Public => render_public(family, spec),
        CloudRole::Private => spec
            .v4
            .vpc
            .as_ref()
            .map(|vpc| render_private(family, vpc))
            .unwrap_or_default(),
    }
}

fn eth0_vars(primary: &Ipv4Assignment, spec: Option<&NetworkSpec>) -> Vars {
    let mut vars = Vars::default();
    vars.v4("", primary);
    match spec {
        Some(spec) => {
            if let Some(anchor) = spec.public_secondary() {
                vars.v4("anchor_", anchor);
            }
            match spec.v6.as_ref() {
                Some(v6) => vars.v6(v6),
                None => vars.set("v6_init", "no"),
            };
        }
        None => {
            vars.set("v6_init", "no");
        }
    }
    vars
}

fn render_public(family: OsFamily, spec: &NetworkSpec) -> Vec<NetworkFile> {
    let eth0 = spec.public_primary().map(|p| eth0_vars(p, Some(spec)));
    let eth1 = spec.v4.private.as_ref().map(|p| {
        let mut vars = Vars::default();
        vars.v4("", p);
        vars
    });
    let eth2 = spec.v4.vpc.as_ref().map(|p| {
        let mut vars = Vars::default();
        vars.v4("", p);
        vars
    });

    match family {
        OsFamily::Debian | OsFamily::Alpine => {
            let mut contents = String::new();
            if let Some(vars) = &eth0 {
                contents.push_str(&fill(DEBIAN_ETH0, vars));
                if spec.v6.is_some() {
                    contents.push_str(&fill(DEBIAN_ETH0_V6, vars));
                }
                if spec.public_secondary().is_some() {
                    contents.push_str(&fill(DEBIAN_ETH0_ANCHOR, vars));
                }
            }
            if let Some(vars) = &eth1 {
                contents.push_str(&fill(DEBIAN_ETH1, vars));
            }
            if let Some(vars) = &eth2 {
                contents.push_str(&fill(DEBIAN_ETH2, vars));
            }
            single(DEBIAN_INTERFACES, contents, Some(0o644))
        }
        OsFamily::RedHat => {
            let mut files = Vec::new();
            if let Some(vars) = &eth0 {
                files.push(file(REDHAT_ETH0, fill(REDHAT_IFCFG_ETH0, vars), Some(0o644)));
            }
            if let Some(vars) = &eth1 {
                files.push(file(REDHAT_ETH1, fill(REDHAT_IFCFG_ETH1, vars), Some(0o644)));
            }
            files
        }
        OsFamily::Fedora => {
            let mut files = Vec::new();
            if let Some(vars) = &eth0 {
                let mut contents = fill(FEDORA_NM_ETH0, vars);
                if spec.v6.is_some() {
                    contents.push_str(&fill(FEDORA_NM_V6, vars));
                }
                contents.push_str(FEDORA_NM_TAIL);
                files.push(file(FEDORA_ETH0, contents, Some(0o600)));
            }
            if let Some(vars) = &eth1 {
                files.push(file(FEDORA_ETH1, fill(FEDORA_NM_ETH1, vars), Some(0o600)));
            }
            files
        }
        OsFamily::Windows => {
            let mut contents = String::new();
            if let Some(vars) = &eth0 {
                contents.push_str(&fill(WINDOWS_ETH0, vars));
                if spec.public_secondary().is_some() {
                    contents.push_str(&fill(WINDOWS_ETH0_ANCHOR, vars));
                }
                if spec.v6.is_some() {
                    contents.push_str(&fill(WINDOWS_ETH0_V6, vars));
                }
            }
            if let Some(vars) = &eth1 {
                contents.push_str(&fill(WINDOWS_ETH1, vars));
            }
            single(WINDOWS_FIRST_BOOT, contents, None)
        }
        OsFamily::Unknown => Vec::new(),
    }
}

fn render_private(family: OsFamily, vpc: &Ipv4Assignment) -> Vec<NetworkFile> {
    let vars = eth0_vars(vpc, None);
    match family {
        OsFamily::Debian | OsFamily::Alpine => {
            vec![file(DEBIAN_INTERFACES, fill(DEBIAN_ETH0, &vars), Some(0o644))]
        }
        OsFamily::RedHat => {
            vec![file(REDHAT_ETH0, fill(REDHAT_IFCFG_ETH0, &vars), Some(0o644))]
        }
        OsFamily::Fedora => {
            let mut vars = vars;
            vars.set("autoconnect_priority", "-999");
            let mut contents = fill(FEDORA_NM_ETH0, &vars);
            contents.push_str(FEDORA_NM_V6_AUTO);
            contents.push_str(FEDORA_NM_TAIL);
            vec![file(FEDORA_ETH0, contents, Some(0o600))]
        }
        OsFamily::Windows => vec![file(WINDOWS_FIRST_BOOT, fill(WINDOWS_ETH0, &vars), None)],
        OsFamily::Unknown => Vec::new(),
    }
}

fn file(path: &'static str, contents: String, mode: Option<u32>) -> NetworkFile {
    NetworkFile {
        path,
        contents,
        mode,
    }
}

fn single(path: &'static str, contents: String, mode: Option<u32>) -> Vec<NetworkFile> {
    if contents.is_empty() {
        Vec::new()
    } else {
        vec![file(path, contents, mode)]
    }
}

/// Rewrites the anchor address in a previously rendered network file.
///
/// Returns `None` when the file holds no anchor entry to rewrite.
pub fn replace_anchor(family: OsFamily, contents: &str, anchor: &Ipv4Assignment) -> Option<String> {
    match family {
        OsFamily::Debian | OsFamily::Alpine => replace_debian_anchor(contents, anchor),
        OsFamily::RedHat => replace_keyed(
            contents,
            &[
                ("IPADDR2=", anchor.address.to_string()),
                ("PREFIX2=", anchor.prefix().to_string()),
            ],
        ),
        OsFamily::Fedora => replace_keyed(
            contents,
            &[(
                "address2=",
                format!("{}/{}", anchor.address, anchor.prefix()),
            )],
        ),
        OsFamily::Windows | OsFamily::Unknown => None,
    }
}

fn replace_keyed(contents: &str, keys: &[(&str, String)]) -> Option<String> {
    let mut replaced = false;
    let mut out = String::with_capacity(contents.len());
    for line in contents.split_inclusive('\n') {
        let key = keys.iter().find(|(key, _)| line.starts_with(key));
        match key {
            Some((key, value)) => {
                replaced = true;
                out.push_str(key);
                out.push_str(value);
                if line.ends_with('\n') {
                    out.push('\n');
                }
            }
            None => out.push_str(line),
        }
    }
    replaced.then_some(out)
}

// The anchor is the second static IPv4 stanza of eth0.
fn replace_debian_anchor(contents: &str, anchor: &Ipv4Assignment) -> Option<String> {
    let mut stanzas = 0;
    let mut in_anchor = false;
    let mut replaced = false;
    let mut out = String::with_capacity(contents.len());
    for line in contents.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("iface ") || trimmed.starts_with("auto ") {
            if trimmed == "iface eth0 inet static" {
                stanzas += 1;
            }
            in_anchor = trimmed == "iface eth0 inet static" && stanzas == 2;
            out.push_str(line);
            continue;
        }
        if in_anchor {
            let indent = &line[..line.len() - line.trim_start().len()];
            let eol = if line.ends_with('\n') { "\n" } else { "" };
            if trimmed.starts_with("address ") {
                out.push_str(&format!("{}address {}{}", indent, anchor.address, eol));
                replaced = true;
                continue;
            }
            if trimmed.starts_with("netmask ") {
                out.push_str(&format!("{}netmask {}{}", indent, anchor.netmask, eol));
                continue;
            }
        }
        out.push_str(line);
    }
    replaced.then_some(out)
}
