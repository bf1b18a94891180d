use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::{DeviceSummary, InterfaceKind, NetworkInfo, NetworkInterface};

const DEVICES_HEADER: &str = "list of devices";
const LOOPBACK_IP: &str = "127.0.0.1";

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains(DEVICES_HEADER))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let serial = tokens[0].to_string();
            // "no permissions (...)" spans several tokens; keep the first word as the state.
            let state = tokens[1].to_string();
            let mut model = None;
            let mut product = None;
            let mut device = None;
            let mut transport_id = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("device:") {
                    device = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    transport_id = Some(value.to_string());
                }
            }
            Some(DeviceSummary {
                serial,
                state,
                model,
                product,
                device,
                transport_id,
            })
        })
        .collect()
}

/// Serial-only pass over `adb devices` output, used to size the fleet before a full scan.
pub fn parse_device_serials(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.to_lowercase().contains(DEVICES_HEADER))
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter_map(|line| {
            let (serial, _) = line.split_once('\t')?;
            let serial = serial.trim();
            (!serial.is_empty()).then(|| serial.to_string())
        })
        .collect()
}

/// `model:Pixel_7` is reported with underscores in place of spaces.
pub fn display_model(model_hint: &str) -> String {
    model_hint.replace('_', " ")
}

pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Single-property `getprop <name>` output; empty means unset.
pub fn parse_getprop_value(output: &str) -> Option<String> {
    let value = output.trim();
    (!value.is_empty()).then(|| value.to_string())
}

pub fn parse_pm_list_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|package| package.trim().to_string())
        .filter(|package| !package.is_empty())
        .collect()
}

/// `wm size` output, preferring the override size when one is set.
pub fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let mut physical = None;
    let mut override_size = None;
    for line in output.lines() {
        let trimmed = line.trim();
        let Some((label, value)) = trimmed.split_once(':') else {
            continue;
        };
        let Some((width, height)) = value.trim().split_once('x') else {
            continue;
        };
        let (Ok(width), Ok(height)) = (width.trim().parse::<u32>(), height.trim().parse::<u32>())
        else {
            continue;
        };
        if label.to_lowercase().contains("override") {
            override_size = Some((width, height));
        } else {
            physical = Some((width, height));
        }
    }
    override_size.or(physical)
}

fn interface_header_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+:\s+([^:@\s]+)(?:@[^:\s]+)?:").ok())
        .as_ref()
}

fn inet_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*inet\s+(\d+\.\d+\.\d+\.\d+)").ok())
        .as_ref()
}

fn ifconfig_inet_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"inet addr:(\d+\.\d+\.\d+\.\d+)").ok())
        .as_ref()
}

/// IPv4 addresses from `ip addr show`, loopback excluded.
pub fn parse_ip_addr(output: &str) -> Vec<NetworkInterface> {
    let (Some(header_re), Some(inet_re)) = (interface_header_re(), inet_re()) else {
        return Vec::new();
    };
    let mut interfaces = Vec::new();
    let mut current: Option<String> = None;
    for line in output.lines() {
        if let Some(caps) = header_re.captures(line) {
            current = Some(caps[1].to_string());
            continue;
        }
        let Some(name) = current.as_ref() else {
            continue;
        };
        if let Some(caps) = inet_re.captures(line) {
            let ip = caps[1].to_string();
            if ip == LOOPBACK_IP {
                continue;
            }
            interfaces.push(NetworkInterface {
                name: name.clone(),
                ip,
                kind: InterfaceKind::from_name(name),
            });
        }
    }
    interfaces
}

/// Legacy `ifconfig` output for devices without `ip`.
pub fn parse_ifconfig(output: &str) -> Vec<NetworkInterface> {
    let Some(inet_re) = ifconfig_inet_re() else {
        return Vec::new();
    };
    let mut interfaces = Vec::new();
    let mut current: Option<String> = None;
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('\t') {
            current = line
                .split_whitespace()
                .next()
                .map(|name| name.trim_end_matches(':').to_string());
            continue;
        }
        let Some(name) = current.as_ref() else {
            continue;
        };
        if let Some(caps) = inet_re.captures(line) {
            let ip = caps[1].to_string();
            if ip == LOOPBACK_IP {
                continue;
            }
            interfaces.push(NetworkInterface {
                name: name.clone(),
                ip,
                kind: InterfaceKind::from_name(name),
            });
        }
    }
    interfaces
}

/// Primary address is the first one found, replaced by a `wlan` interface when present.
pub fn build_network_info(interfaces: Vec<NetworkInterface>) -> NetworkInfo {
    let mut primary: Option<&NetworkInterface> = None;
    for interface in &interfaces {
        match primary {
            None => primary = Some(interface),
            Some(_) if interface.name.to_lowercase().contains("wlan") => {
                primary = Some(interface)
            }
            Some(_) => {}
        }
    }
    let primary_ip = primary.map(|interface| interface.ip.clone());
    let primary_interface = primary.map(|interface| interface.name.clone());
    NetworkInfo {
        interfaces,
        primary_ip,
        primary_interface,
    }
}
