use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use crate::PerchError;

/// Largest trim `window_sit.y_offset` may apply, as a fraction of pet height.
pub const SIT_OFFSET_LIMIT: f32 = 0.015;

#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub window_sitting: bool,
    pub transparent_input: bool,
    pub snap_zone: SnapZoneConfig,
    /// Fine vertical trim while sitting, as a fraction of pet height.
    pub sit_y_offset: f32,
    pub vertical_offset: i32,
    pub base_offset: f32,
    pub base_scale: f32,
    pub cache_cooldown_ms: u32,
    pub drag_smoothing: f32,
    pub damage_poll_interval_ms: u32,
    pub frame_interval_ms: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SnapZoneConfig {
    pub offset_x: f32,
    pub offset_y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for SnapZoneConfig {
    fn default() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: -5.0,
            width: 100.0,
            height: 10.0,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            window_sitting: true,
            transparent_input: true,
            snap_zone: SnapZoneConfig::default(),
            sit_y_offset: 0.0,
            vertical_offset: 0,
            base_offset: 40.0,
            base_scale: 1.0,
            cache_cooldown_ms: 50,
            drag_smoothing: 0.0,
            damage_poll_interval_ms: 4,
            frame_interval_ms: 16,
        }
    }
}

impl RuntimeConfig {
    pub fn cache_cooldown(&self) -> Duration {
        Duration::from_millis(u64::from(self.cache_cooldown_ms))
    }

    pub fn damage_poll_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.damage_poll_interval_ms))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_interval_ms))
    }
}

pub struct LoadedConfig {
    pub path: PathBuf,
    pub config: RuntimeConfig,
}

pub fn load_or_create_default() -> Result<LoadedConfig, PerchError> {
    let path = config_path()?;
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                PerchError::Config(format!(
                    "failed to create config directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        fs::write(&path, default_config_template()).map_err(|err| {
            PerchError::Config(format!(
                "failed to write default config {}: {err}",
                path.display()
            ))
        })?;
        tracing::info!(path = %path.display(), "created default config.lua");
    }

    let config = load_from_path(&path)?;
    Ok(LoadedConfig { path, config })
}

pub fn load_from_path(path: &Path) -> Result<RuntimeConfig, PerchError> {
    if !path.exists() {
        return Err(PerchError::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    let content = fs::read_to_string(path).map_err(|err| {
        PerchError::Config(format!("failed to read config {}: {err}", path.display()))
    })?;
    if content.trim().is_empty() {
        tracing::info!(path = %path.display(), "config.lua is empty; using defaults");
        return Ok(RuntimeConfig::default());
    }

    let values = load_lua_values(path)?;
    load_from_values(&values)
}

/// Builds a validated config from flattened `key=value` pairs. Missing keys
/// keep their defaults.
pub fn load_from_values(values: &HashMap<String, String>) -> Result<RuntimeConfig, PerchError> {
    let mut config = RuntimeConfig::default();

    config.window_sitting =
        parse_bool_flexible(values, "window_sitting.enabled", config.window_sitting)?;
    config.transparent_input =
        parse_bool_flexible(values, "transparent_input.enabled", config.transparent_input)?;

    config.snap_zone.offset_x = parse_f32(values, "snap_zone.offset_x", config.snap_zone.offset_x)?;
    config.snap_zone.offset_y = parse_f32(values, "snap_zone.offset_y", config.snap_zone.offset_y)?;
    config.snap_zone.width = parse_f32(values, "snap_zone.width", config.snap_zone.width)?;
    config.snap_zone.height = parse_f32(values, "snap_zone.height", config.snap_zone.height)?;
    if config.snap_zone.width <= 0.0 || config.snap_zone.height <= 0.0 {
        return Err(PerchError::Config(
            "snap_zone.width and snap_zone.height must be greater than 0".to_owned(),
        ));
    }

    config.sit_y_offset = parse_f32(values, "window_sit.y_offset", config.sit_y_offset)?;
    if !(-SIT_OFFSET_LIMIT..=SIT_OFFSET_LIMIT).contains(&config.sit_y_offset) {
        return Err(PerchError::Config(format!(
            "window_sit.y_offset must be between -{SIT_OFFSET_LIMIT} and {SIT_OFFSET_LIMIT}"
        )));
    }

    config.vertical_offset = parse_i32(values, "vertical_offset", config.vertical_offset)?;
    config.base_offset = parse_f32(values, "base_offset", config.base_offset)?;
    config.base_scale = parse_f32(values, "base_scale", config.base_scale)?;
    if config.base_scale <= 0.0 {
        return Err(PerchError::Config(
            "base_scale must be greater than 0".to_owned(),
        ));
    }

    config.cache_cooldown_ms = parse_u32(values, "cache_cooldown_ms", config.cache_cooldown_ms)?;

    config.drag_smoothing = parse_f32(values, "drag.smoothing", config.drag_smoothing)?;
    if !(0.0..1.0).contains(&config.drag_smoothing) {
        return Err(PerchError::Config(
            "drag.smoothing must be >= 0 and < 1".to_owned(),
        ));
    }

    config.damage_poll_interval_ms = parse_u32(
        values,
        "damage.poll_interval_ms",
        config.damage_poll_interval_ms,
    )?;
    if config.damage_poll_interval_ms == 0 {
        return Err(PerchError::Config(
            "damage.poll_interval_ms must be >= 1".to_owned(),
        ));
    }

    config.frame_interval_ms = parse_u32(values, "frame_interval_ms", config.frame_interval_ms)?;
    if config.frame_interval_ms == 0 {
        return Err(PerchError::Config(
            "frame_interval_ms must be >= 1".to_owned(),
        ));
    }

    Ok(config)
}

fn config_path() -> Result<PathBuf, PerchError> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Ok(PathBuf::from(xdg).join("perch").join("config.lua"));
    }

    if let Some(home) = std::env::var_os("HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home)
            .join(".config")
            .join("perch")
            .join("config.lua"));
    }

    Err(PerchError::Config(
        "unable to resolve config path: HOME and XDG_CONFIG_HOME are unset".to_owned(),
    ))
}

fn load_lua_values(path: &Path) -> Result<HashMap<String, String>, PerchError> {
    let output = Command::new("lua")
        .arg("-e")
        .arg(lua_loader_script())
        .env("PERCH_CONFIG_PATH", path)
        .output()
        .map_err(|err| PerchError::Config(format!("failed to execute lua: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let reason = if stderr.is_empty() {
            "lua exited with non-zero status".to_owned()
        } else {
            stderr
        };
        return Err(PerchError::Config(format!(
            "failed to load {}: {reason}",
            path.display()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_key_value_stdout(&stdout)
}

fn parse_key_value_stdout(stdout: &str) -> Result<HashMap<String, String>, PerchError> {
    let mut values = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(PerchError::Config(format!("invalid lua output line: {line}")));
        };
        values.insert(key.to_owned(), value.to_owned());
    }
    Ok(values)
}

fn parse_u32(values: &HashMap<String, String>, key: &str, default: u32) -> Result<u32, PerchError> {
    match values.get(key) {
        // Lua prints integral floats as "50.0" on 5.3+.
        Some(raw) => raw
            .strip_suffix(".0")
            .unwrap_or(raw)
            .parse::<u32>()
            .map_err(|err| PerchError::Config(format!("invalid value for {key}: {raw} ({err})"))),
        None => Ok(default),
    }
}

fn parse_i32(values: &HashMap<String, String>, key: &str, default: i32) -> Result<i32, PerchError> {
    match values.get(key) {
        Some(raw) => raw
            .strip_suffix(".0")
            .unwrap_or(raw)
            .parse::<i32>()
            .map_err(|err| PerchError::Config(format!("invalid value for {key}: {raw} ({err})"))),
        None => Ok(default),
    }
}

fn parse_f32(values: &HashMap<String, String>, key: &str, default: f32) -> Result<f32, PerchError> {
    match values.get(key) {
        Some(raw) => {
            let value = raw.parse::<f32>().map_err(|err| {
                PerchError::Config(format!("invalid value for {key}: {raw} ({err})"))
            })?;
            if !value.is_finite() {
                return Err(PerchError::Config(format!(
                    "invalid value for {key}: {raw} (not finite)"
                )));
            }
            Ok(value)
        }
        None => Ok(default),
    }
}

fn parse_bool_flexible(
    values: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, PerchError> {
    let Some(raw) = values.get(key) else {
        return Ok(default);
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(PerchError::Config(format!(
            "invalid value for {key}: {raw} (expected bool or 0/1)"
        ))),
    }
}

fn default_config_template() -> &'static str {
    r#"-- perch config
-- File: ~/.config/perch/config.lua (or $XDG_CONFIG_HOME/perch/config.lua)
-- Reloaded on SIGHUP.
return {
  window_sitting = {
    enabled = true,
  },
  transparent_input = {
    enabled = true,
  },
  -- Area under the pet that has to touch a window's top edge to sit on it.
  snap_zone = {
    offset_x = 0,
    offset_y = -5,
    width = 100,
    height = 10,
  },
  window_sit = {
    -- Fine trim as a fraction of pet height, -0.015 .. 0.015.
    y_offset = 0.0,
  },
  vertical_offset = 0,
  base_offset = 40,
  base_scale = 1.0,
  cache_cooldown_ms = 50,
  drag = {
    -- 0 follows the pointer exactly.
    smoothing = 0.0,
  },
  damage = {
    poll_interval_ms = 4,
  },
  frame_interval_ms = 16,
}
"#
}

fn lua_loader_script() -> &'static str {
    r#"
local path = os.getenv("PERCH_CONFIG_PATH")
if type(path) ~= "string" or path == "" then
  io.stderr:write("PERCH_CONFIG_PATH is not set\n")
  os.exit(1)
end

local chunk, load_err = loadfile(path)
if not chunk then
  io.stderr:write(load_err .. "\n")
  os.exit(1)
end

local ok, result = pcall(chunk)
if not ok then
  io.stderr:write(result .. "\n")
  os.exit(1)
end

local cfg = nil
if type(result) == "table" then
  cfg = result
elseif type(_G.config) == "table" then
  cfg = _G.config
else
  cfg = {}
end

local function emit(key, value)
  io.write(key)
  io.write("=")
  io.write(tostring(value))
  io.write("\n")
end

local function expect_table(name, value)
  if value ~= nil and type(value) ~= "table" then
    io.stderr:write(name .. " must be a table\n")
    os.exit(1)
  end
end

local function emit_number(name, value)
  if value == nil then
    return
  end
  if type(value) ~= "number" then
    io.stderr:write(name .. " must be a number\n")
    os.exit(1)
  end
  emit(name, value)
end

local function emit_bool_like(name, value)
  if value == nil then
    return
  end
  if type(value) == "boolean" or type(value) == "number" then
    emit(name, value)
    return
  end
  io.stderr:write(name .. " must be a boolean or number\n")
  os.exit(1)
end

local function pick(primary, fallback)
  if primary ~= nil then
    return primary
  end
  return fallback
end

expect_table("window_sitting", cfg.window_sitting)
expect_table("transparent_input", cfg.transparent_input)
expect_table("snap_zone", cfg.snap_zone)
expect_table("window_sit", cfg.window_sit)
expect_table("drag", cfg.drag)
expect_table("damage", cfg.damage)

local window_sitting = cfg.window_sitting or {}
local transparent_input = cfg.transparent_input or {}
local snap_zone = cfg.snap_zone or {}
local window_sit = cfg.window_sit or {}
local drag = cfg.drag or {}
local damage = cfg.damage or {}

emit_bool_like("window_sitting.enabled", pick(window_sitting.enabled, cfg.window_sitting_enabled))
emit_bool_like("transparent_input.enabled", pick(transparent_input.enabled, cfg.transparent_input_enabled))

emit_number("snap_zone.offset_x", snap_zone.offset_x)
emit_number("snap_zone.offset_y", snap_zone.offset_y)
emit_number("snap_zone.width", snap_zone.width)
emit_number("snap_zone.height", snap_zone.height)

emit_number("window_sit.y_offset", pick(window_sit.y_offset, cfg.window_sit_y_offset))
emit_number("vertical_offset", cfg.vertical_offset)
emit_number("base_offset", cfg.base_offset)
emit_number("base_scale", cfg.base_scale)
emit_number("cache_cooldown_ms", cfg.cache_cooldown_ms)
emit_number("drag.smoothing", pick(drag.smoothing, cfg.drag_smoothing))
emit_number("damage.poll_interval_ms", pick(damage.poll_interval_ms, cfg.damage_poll_interval_ms))
emit_number("frame_interval_ms", cfg.frame_interval_ms)
"#
}
