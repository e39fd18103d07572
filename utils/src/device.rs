use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;

fn get_host() -> cpal::Host {
    cpal::default_host()
}

pub fn get_or_default_input(device_name: Option<String>) -> anyhow::Result<Device> {
    let host = get_host();
    tracing::debug!("host: {:?}", host.id());
    match device_name {
        None => host
            .default_input_device()
            .context("no default input device"),
        Some(target) => host
            .input_devices()?
            .find(|d| d.name().is_ok_and(|name| name == target))
            .with_context(|| format!("input device not found: {target}")),
    }
}

pub fn get_or_default_output(device_name: Option<String>) -> anyhow::Result<Device> {
    let host = get_host();
    match device_name {
        None => host
            .default_output_device()
            .context("no default output device"),
        Some(target) => host
            .output_devices()?
            .find(|d| d.name().is_ok_and(|name| name == target))
            .with_context(|| format!("output device not found: {target}")),
    }
}

fn describe(name: &str, channels: u16, sample_rate: u32, default: bool) -> String {
    let mut d = format!(" * {}({}ch, {}hz)", name, channels, sample_rate);
    if default {
        d.push_str(" [default]");
    }
    d
}

pub fn get_available_inputs() -> anyhow::Result<String> {
    for host in cpal::available_hosts() {
        tracing::debug!("available host: {:?}", host);
    }
    let host = get_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut device_names = Vec::new();
    for device in host.input_devices()? {
        let Ok(name) = device.name() else { continue };
        let Ok(config) = device.default_input_config() else {
            tracing::debug!("skipping input without a default config: {}", name);
            continue;
        };
        let is_default = default_name.as_deref() == Some(name.as_str());
        device_names.push(describe(&name, config.channels(), config.sample_rate().0, is_default));
    }
    Ok(device_names.join("\n"))
}

pub fn get_available_outputs() -> anyhow::Result<String> {
    let host = get_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut device_names = Vec::new();
    for device in host.output_devices()? {
        let Ok(name) = device.name() else { continue };
        let Ok(config) = device.default_output_config() else {
            tracing::debug!("skipping output without a default config: {}", name);
            continue;
        };
        let is_default = default_name.as_deref() == Some(name.as_str());
        device_names.push(describe(&name, config.channels(), config.sample_rate().0, is_default));
    }
    Ok(device_names.join("\n"))
}
