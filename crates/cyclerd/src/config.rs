//! Daemon configuration.
//!
//! Two collaborating files, both read only on explicit `setup`/reload:
//! `settings.toml` (loaded through figment, env vars override under the
//! `CYCLERD_` prefix) and a YAML device file listing devices and pipeline
//! templates. Once loaded, a configuration is an immutable snapshot; the
//! daemon swaps the whole snapshot atomically, never mutates it in place.

use cycler_core::error::{CyclerError, CyclerResult};
use cycler_core::pipeline::{Binding, Device, Pipeline};
use cycler_core::request::PipelineTemplate;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// SQLite database holding the job queue.
    pub queue_path: PathBuf,
    /// Root of the per-job output storage tree.
    pub storage_dir: PathBuf,
    /// Scheduler tick cadence in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,
    /// Executor status/data poll cadence in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_tick_ms() -> u64 {
    500
}

fn default_poll_ms() -> u64 {
    1000
}

impl Settings {
    /// Defaults rooted in a data directory, the equivalent of `init`.
    pub fn defaults_in(data_dir: &Path) -> Self {
        Self {
            queue_path: data_dir.join("database.db"),
            storage_dir: data_dir.join("jobs"),
            tick_interval_ms: default_tick_ms(),
            poll_interval_ms: default_poll_ms(),
        }
    }

    /// Load settings from a TOML file with `CYCLERD_*` env overrides.
    pub fn load(path: &Path) -> CyclerResult<Self> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CYCLERD_"))
            .extract()
            .map_err(|e| CyclerError::Config(format!("settings '{}': {e}", path.display())))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Shape of the YAML device file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFile {
    pub devices: Vec<Device>,
    pub pipelines: Vec<PipelineTemplate>,
}

impl DeviceFile {
    pub fn load(path: &Path) -> CyclerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| CyclerError::Config(format!("device file '{}': {e}", path.display())))
    }
}

/// Devices keyed by name, as referenced from pipeline bindings.
pub type DeviceMap = HashMap<String, Device>;

pub fn device_map(devices: &[Device]) -> CyclerResult<DeviceMap> {
    let mut map = DeviceMap::with_capacity(devices.len());
    for dev in devices {
        if map.insert(dev.name.clone(), dev.clone()).is_some() {
            return Err(CyclerError::Config(format!(
                "duplicate device name '{}'",
                dev.name
            )));
        }
    }
    Ok(map)
}

/// Expand pipeline templates into concrete pipelines.
///
/// A `*` in the template name expands into one pipeline per channel of its
/// single referenced device, substituting the channel id for the marker. A
/// template without a wildcard must name an explicit channel per device, and
/// that channel must exist on the device.
pub fn expand_pipelines(
    devices: &DeviceMap,
    templates: &[PipelineTemplate],
) -> CyclerResult<Vec<Pipeline>> {
    let mut out = Vec::new();
    for template in templates {
        if template.name.contains('*') {
            expand_wildcard(devices, template, &mut out)?;
        } else {
            out.push(expand_explicit(devices, template)?);
        }
    }

    let mut seen = HashMap::new();
    for pip in &out {
        if seen.insert(pip.name.clone(), ()).is_some() {
            return Err(CyclerError::Config(format!(
                "pipeline name '{}' expands more than once",
                pip.name
            )));
        }
    }
    Ok(out)
}

fn expand_wildcard(
    devices: &DeviceMap,
    template: &PipelineTemplate,
    out: &mut Vec<Pipeline>,
) -> CyclerResult<()> {
    let [binding] = template.devices.as_slice() else {
        return Err(CyclerError::Config(format!(
            "wildcard pipeline '{}' must reference exactly one device",
            template.name
        )));
    };
    let device = lookup(devices, &binding.name, &template.name)?;
    for &channel in &device.channels {
        let name = template.name.replace('*', &channel.to_string());
        out.push(Pipeline::new(
            name,
            vec![Binding {
                device: device.name.clone(),
                channel,
                tag: binding.tag.clone(),
            }],
        ));
    }
    Ok(())
}

fn expand_explicit(devices: &DeviceMap, template: &PipelineTemplate) -> CyclerResult<Pipeline> {
    let mut bindings = Vec::with_capacity(template.devices.len());
    for tb in &template.devices {
        let device = lookup(devices, &tb.name, &template.name)?;
        let channel = tb.channel.ok_or_else(|| {
            CyclerError::Config(format!(
                "pipeline '{}' binding to '{}' needs an explicit channel",
                template.name, tb.name
            ))
        })?;
        if !device.channels.contains(&channel) {
            return Err(CyclerError::Config(format!(
                "pipeline '{}': device '{}' has no channel {}",
                template.name, tb.name, channel
            )));
        }
        bindings.push(Binding {
            device: device.name.clone(),
            channel,
            tag: tb.tag.clone(),
        });
    }
    Ok(Pipeline::new(template.name.clone(), bindings))
}

fn lookup<'a>(devices: &'a DeviceMap, name: &str, pipeline: &str) -> CyclerResult<&'a Device> {
    devices.get(name).ok_or_else(|| {
        CyclerError::Config(format!(
            "pipeline '{pipeline}' references unknown device '{name}'"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycler_core::request::TemplateBinding;

    fn device(name: &str, channels: &[u32]) -> Device {
        Device {
            name: name.into(),
            driver: "mock".into(),
            address: format!("sim:{name}"),
            channels: channels.to_vec(),
            libpath: None,
            lockpath: None,
            retries: 3,
            retry_interval_s: 1,
        }
    }

    fn template(name: &str, bindings: &[(&str, Option<u32>)]) -> PipelineTemplate {
        PipelineTemplate {
            name: name.into(),
            devices: bindings
                .iter()
                .map(|(dev, ch)| TemplateBinding {
                    name: (*dev).to_string(),
                    tag: Some("worker".into()),
                    channel: *ch,
                })
                .collect(),
        }
    }

    #[test]
    fn wildcard_expands_one_pipeline_per_channel() {
        let devices = device_map(&[device("cycler-1", &[1, 2, 5])]).expect("map");
        let templates = vec![template("cell-*", &[("cycler-1", None)])];
        let pipelines = expand_pipelines(&devices, &templates).expect("expand");
        let names: Vec<_> = pipelines.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["cell-1", "cell-2", "cell-5"]);
        assert_eq!(pipelines[2].bindings[0].channel, 5);
    }

    #[test]
    fn explicit_binding_checks_channel_exists() {
        let devices = device_map(&[device("cycler-1", &[1, 2])]).expect("map");
        let bad = vec![template("cell-09", &[("cycler-1", Some(9))])];
        let err = expand_pipelines(&devices, &bad).expect_err("channel 9 missing");
        assert!(err.to_string().contains("no channel 9"));

        let good = vec![template("cell-02", &[("cycler-1", Some(2))])];
        let pipelines = expand_pipelines(&devices, &good).expect("expand");
        assert_eq!(pipelines[0].bindings[0].channel, 2);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let devices = device_map(&[]).expect("map");
        let templates = vec![template("cell-01", &[("ghost", Some(1))])];
        let err = expand_pipelines(&devices, &templates).expect_err("unknown device");
        assert!(err.to_string().contains("unknown device 'ghost'"));
    }

    #[test]
    fn wildcard_with_two_devices_is_rejected() {
        let devices =
            device_map(&[device("a", &[1]), device("b", &[1])]).expect("map");
        let templates = vec![template("cell-*", &[("a", None), ("b", None)])];
        assert!(expand_pipelines(&devices, &templates).is_err());
    }

    #[test]
    fn settings_load_from_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "queue_path = \"/tmp/q.db\"\nstorage_dir = \"/tmp/jobs\"\ntick_interval_ms = 250\n",
        )
        .expect("write");
        let settings = Settings::load(&path).expect("load");
        assert_eq!(settings.tick_interval(), Duration::from_millis(250));
        assert_eq!(settings.poll_interval_ms, default_poll_ms());
    }

    #[test]
    fn device_file_yaml_round_trip() {
        let yaml = r#"
devices:
  - name: cycler-1
    driver: mock
    address: "sim:cycler-1"
    channels: [1, 2]
pipelines:
  - name: "cell-*"
    devices:
      - name: cycler-1
        tag: worker
"#;
        let file: DeviceFile = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(file.devices[0].retries, 10);
        assert_eq!(file.pipelines[0].name, "cell-*");
    }
}
