use crate::domain::model::{OptionValue, ValueType};
use crate::utils::error::{Result, WkeError};
use std::fs;
use std::path::{Path, PathBuf};

pub const TARGET_FOLDER: &str = "targets";
pub const PRELUDE_FOLDER: &str = "preludes";
pub const PROTECTED_NAMES: [&str; 3] = ["all", "help", "copy-data"];

/// Name of the built-in target that installs `[ubuntu]` packages.
pub const INSTALL_PACKAGES: &str = "install-packages";

const NO_DESCRIPTION: &str = "No description";

/// Accepts `value` as `value_type`, widening integers to floats.
fn conform(value: OptionValue, value_type: Option<ValueType>) -> Option<OptionValue> {
    match (value, value_type) {
        (value, None) => Some(value),
        (OptionValue::Int(i), Some(ValueType::Float)) => Some(OptionValue::Float(i as f64)),
        (value, Some(expected)) if value.value_type() == expected => Some(value),
        _ => None,
    }
}

/// An option of a target, passed to the script as a positional argument.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetOption {
    name: String,
    default: Option<OptionValue>,
    value_type: Option<ValueType>,
    choices: Option<Vec<OptionValue>>,
}

impl TargetOption {
    pub fn new(
        name: impl Into<String>,
        default: Option<OptionValue>,
        value_type: Option<ValueType>,
        choices: Option<Vec<OptionValue>>,
    ) -> Result<Self> {
        let name = name.into();

        let default = match default {
            Some(value) => Some(conform(value.clone(), value_type).ok_or_else(|| {
                WkeError::config(format!(
                    "Default value `{}` of option \"{}\" is not of type {}",
                    value,
                    name,
                    value_type.map(|t| t.to_string()).unwrap_or_default()
                ))
            })?),
            None => None,
        };

        let choices = match choices {
            Some(choices) => {
                let mut conformed = Vec::with_capacity(choices.len());
                for choice in choices {
                    conformed.push(conform(choice.clone(), value_type).ok_or_else(|| {
                        WkeError::config(format!(
                            "Choice `{}` of option \"{}\" has the wrong type",
                            choice, name
                        ))
                    })?);
                }
                Some(conformed)
            }
            None => None,
        };

        Ok(Self {
            name,
            default,
            value_type,
            choices,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` if any type is accepted.
    pub fn value_type(&self) -> Option<ValueType> {
        self.value_type
    }

    pub fn required(&self) -> bool {
        self.default.is_none()
    }

    /// `None` if all values are allowed.
    pub fn choices(&self) -> Option<&[OptionValue]> {
        self.choices.as_deref()
    }

    pub fn default_value(&self) -> Option<&OptionValue> {
        self.default.as_ref()
    }
}

/// Environment setup that runs before a target, e.g. exporting `$PATH`.
#[derive(Debug, Clone)]
pub struct Prelude {
    name: String,
    path: Option<PathBuf>,
    about: String,
}

impl Prelude {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn about(&self) -> &str {
        &self.about
    }

    /// The prelude script turned into a `cmd1 && cmd2 && ` chain.
    pub fn command(&self) -> Result<String> {
        let path = self.path.as_ref().ok_or_else(|| {
            WkeError::config(format!("No script found for prelude \"{}\"", self.name))
        })?;
        let content = fs::read_to_string(path)?;
        let mut lines = content.lines();

        let first = lines.next().unwrap_or("");
        if !first.contains("#!") {
            return Err(WkeError::config(format!(
                "First line of prelude in {} not a shebang: {}",
                path.display(),
                first
            )));
        }
        if !first.contains("bash") {
            return Err(WkeError::config(format!(
                "Only bash preludes are supported, but {} is not",
                path.display()
            )));
        }

        Ok(lines
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| format!("{} && ", line))
            .collect())
    }
}

/// A script we can run on one or multiple machines.
#[derive(Debug, Clone)]
pub struct Target {
    name: String,
    about: String,
    path: Option<PathBuf>,
    // Order matters: it defines the position of each argument
    options: Vec<TargetOption>,
}

impl Target {
    fn parse(name: &str, value: &toml::Value, path: Option<PathBuf>, origin: &Path) -> Result<Self> {
        let mut target = Self {
            name: name.to_string(),
            about: NO_DESCRIPTION.to_string(),
            path,
            options: Vec::new(),
        };

        match value {
            toml::Value::Array(entries) => {
                for entry in entries {
                    target.parse_option(entry, origin)?;
                }
            }
            toml::Value::Table(table) => {
                for key in table.keys() {
                    if key != "about" && key != "options" {
                        tracing::warn!(
                            "Unexpected key \"{}\" for target \"{}\" at {}",
                            key,
                            name,
                            origin.display()
                        );
                    }
                }

                if let Some(options) = table.get("options") {
                    let entries = options.as_array().ok_or_else(|| {
                        WkeError::config(format!(
                            "Invalid target options at {}: Options must be a list",
                            origin.display()
                        ))
                    })?;
                    for entry in entries {
                        target.parse_option(entry, origin)?;
                    }
                }

                if let Some(about) = table.get("about") {
                    target.about = match about.as_str() {
                        Some(about) => about.to_string(),
                        None => about.to_string(),
                    };
                }
            }
            other => {
                return Err(WkeError::config(format!(
                    "Target \"{}\" at {} is neither a table nor a list, but a {}",
                    name,
                    origin.display(),
                    other.type_str()
                )))
            }
        }

        Ok(target)
    }

    fn parse_option(&mut self, entry: &toml::Value, origin: &Path) -> Result<()> {
        let invalid = |reason: &str| {
            WkeError::config(format!(
                "Invalid target option at {}: {}",
                origin.display(),
                reason
            ))
        };
        let to_value = |value: &toml::Value| {
            OptionValue::from_toml(value)
                .ok_or_else(|| invalid("Values must be strings, numbers, or booleans"))
        };

        let option = match entry {
            toml::Value::String(name) => TargetOption::new(name.as_str(), None, None, None)?,
            toml::Value::Array(items) => {
                let name = items
                    .first()
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| invalid("The first entry of a list must be the name"))?;
                match items.len() {
                    1 => TargetOption::new(name, None, None, None)?,
                    2 => {
                        let default = to_value(&items[1])?;
                        let value_type = default.value_type();
                        TargetOption::new(name, Some(default), Some(value_type), None)?
                    }
                    _ => {
                        return Err(invalid(
                            "Must contain one or two entries if specified as a list",
                        ))
                    }
                }
            }
            toml::Value::Table(table) => {
                let name = table
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| invalid("Must contain \"name\" if specified as a table"))?;

                let default = table.get("default").map(to_value).transpose()?;

                let choices = match table.get("choices") {
                    Some(toml::Value::Array(values)) => {
                        Some(values.iter().map(to_value).collect::<Result<Vec<_>>>()?)
                    }
                    Some(_) => return Err(invalid("\"choices\" must be a list")),
                    None => None,
                };

                let value_type = match table.get("type") {
                    Some(typestr) => {
                        let typestr = typestr.as_str().unwrap_or_default();
                        ValueType::parse(typestr).ok_or_else(|| {
                            WkeError::config(format!("Unsupported value type {}", typestr))
                        })?
                    }
                    None => default.as_ref().map(OptionValue::value_type),
                };

                TargetOption::new(name, default, value_type, choices)?
            }
            _ => return Err(invalid("Not a string, table, or list")),
        };

        self.options.push(option);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn about(&self) -> &str {
        &self.about
    }

    /// Location of the script; `None` if it is missing.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> &[TargetOption] {
        &self.options
    }

    pub fn option_names(&self) -> Vec<&str> {
        self.options.iter().map(TargetOption::name).collect()
    }

    pub fn get_option(&self, option_name: &str) -> Result<&TargetOption> {
        self.options
            .iter()
            .find(|opt| opt.name == option_name)
            .ok_or_else(|| WkeError::config(format!("No such option {}", option_name)))
    }

    /// The contents of the target script.
    pub fn command(&self) -> Result<String> {
        let path = self.path.as_ref().ok_or_else(|| {
            WkeError::config(format!("No script found for command \"{}\"", self.name))
        })?;
        Ok(fs::read_to_string(path)?)
    }
}

/// Holds the contents of a `config.toml` file and its scripts.
///
/// A configuration `N` lives in `<base>/N/` with target scripts in
/// `targets/` and prelude scripts in `preludes/`. It can inherit from other
/// configurations via `[config] inherits`.
#[derive(Debug, Clone)]
pub struct Configuration {
    name: String,
    base_path: PathBuf,
    parent_name: Option<String>,
    default_prelude: Option<String>,
    preludes: Vec<Prelude>,
    targets: Vec<Target>,
    config_toml: toml::Table,
}

impl Configuration {
    /// Loads `<base_path>/<name>/config.toml` and, recursively, its parents.
    pub fn load(name: &str, base_path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_children(name, base_path.as_ref(), &[])
    }

    fn load_with_children(name: &str, base_path: &Path, children: &[String]) -> Result<Self> {
        let path = base_path.join(name).join("config.toml");

        let content = fs::read_to_string(&path).map_err(|err| {
            WkeError::config(format!("Cannot open config file at {}: {}", path.display(), err))
        })?;
        let config_toml: toml::Table = toml::from_str(&content).map_err(|err| {
            WkeError::config(format!(
                "Failed to parse config file at {}: {}",
                path.display(),
                err
            ))
        })?;

        let mut config = Self {
            name: name.to_string(),
            base_path: base_path.to_path_buf(),
            parent_name: None,
            default_prelude: None,
            preludes: Vec::new(),
            targets: Vec::new(),
            config_toml,
        };

        if let Some(targets) = config.config_toml.get("targets") {
            let targets = targets.as_table().ok_or_else(|| {
                WkeError::config(format!("[targets] in {} must be a table", path.display()))
            })?;
            config.targets = config.parse_targets(targets, &path)?;
        }

        if let Some(preludes) = config.config_toml.get("preludes") {
            let preludes = preludes.as_table().ok_or_else(|| {
                WkeError::config(format!("[preludes] in {} must be a table", path.display()))
            })?;
            config.preludes = config.parse_preludes(preludes)?;
        }

        let meta = config
            .config_toml
            .get("config")
            .and_then(toml::Value::as_table)
            .cloned()
            .unwrap_or_default();

        config.default_prelude = meta
            .get("default-prelude")
            .and_then(toml::Value::as_str)
            .map(str::to_string);

        if let Some(parent) = meta.get("inherits") {
            let parent = parent
                .as_str()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    WkeError::config(format!(
                        "`inherits` in {} must be a non-empty string",
                        path.display()
                    ))
                })?;
            config.process_inheritance(parent, children)?;
        }

        Ok(config)
    }

    fn process_inheritance(&mut self, parent_name: &str, children: &[String]) -> Result<()> {
        let mut lineage = children.to_vec();
        lineage.push(self.name.clone());

        if lineage.iter().any(|name| name == parent_name) {
            return Err(WkeError::config(format!(
                "Circular dependency: \"{}\" inherits from \"{}\", which is one of its children",
                self.name, parent_name
            )));
        }

        let parent = Self::load_with_children(parent_name, &self.base_path, &lineage)?;
        self.parent_name = Some(parent_name.to_string());

        let mut merged = parent.config_toml;
        override_config(&mut merged, &self.config_toml);
        self.config_toml = merged;

        let own_preludes = std::mem::replace(&mut self.preludes, parent.preludes);
        for prelude in own_preludes {
            match self.preludes.iter_mut().find(|p| p.name == prelude.name) {
                Some(existing) => {
                    tracing::info!("Overriding parents prelude \"{}\"", prelude.name);
                    *existing = prelude;
                }
                None => self.preludes.push(prelude),
            }
        }

        let own_targets = std::mem::replace(&mut self.targets, parent.targets);
        for mut target in own_targets {
            match self.targets.iter_mut().find(|t| t.name == target.name) {
                Some(existing) => {
                    tracing::info!("Overriding parents target \"{}\"", target.name);
                    // without a script of its own the override keeps the parent's
                    if target.path.is_none() {
                        target.path = existing.path.take();
                    }
                    *existing = target;
                }
                None => self.targets.push(target),
            }
        }

        if self.default_prelude.is_none() {
            self.default_prelude = parent.default_prelude;
        }

        Ok(())
    }

    fn parse_preludes(&self, preludes: &toml::Table) -> Result<Vec<Prelude>> {
        let mut result = Vec::with_capacity(preludes.len());

        for (name, value) in preludes {
            let about = match value {
                toml::Value::String(about) => about.clone(),
                toml::Value::Table(table) => table
                    .get("about")
                    .and_then(toml::Value::as_str)
                    .unwrap_or(NO_DESCRIPTION)
                    .to_string(),
                other => {
                    return Err(WkeError::config(format!(
                        "Prelude has invalid type. Should be string or table, but was {}",
                        other.type_str()
                    )))
                }
            };

            if PROTECTED_NAMES.contains(&name.as_str()) {
                return Err(WkeError::config(format!(
                    "Prelude uses reserved name: {}",
                    name
                )));
            }

            let path = self.prelude_path(name);
            let path = if path.is_file() {
                Some(path)
            } else {
                tracing::warn!("Prelude \"{}::{}\" is missing script!", self.name, name);
                None
            };

            result.push(Prelude {
                name: name.clone(),
                path,
                about,
            });
        }

        Ok(result)
    }

    fn parse_targets(&self, targets: &toml::Table, origin: &Path) -> Result<Vec<Target>> {
        let mut result = Vec::with_capacity(targets.len());

        for (name, value) in targets {
            if PROTECTED_NAMES.contains(&name.as_str()) || name == INSTALL_PACKAGES {
                return Err(WkeError::config(format!(
                    "Make target uses reserved name: {}",
                    name
                )));
            }

            let bash_path = self.target_bash_path(name);
            let python_path = self.target_python_path(name);

            let path = if bash_path.is_file() {
                Some(bash_path)
            } else if python_path.is_file() {
                Some(python_path)
            } else {
                tracing::warn!("Target \"{}::{}\" is missing script!", self.name, name);
                None
            };

            result.push(Target::parse(name, value, path, origin)?);
        }

        Ok(result)
    }

    /// A JSON summary of this configuration, as shown by `show-config`.
    pub fn generate_metadata(&self, verbose: bool) -> serde_json::Value {
        let mut targets = serde_json::Map::new();

        if verbose {
            targets.insert(
                INSTALL_PACKAGES.to_string(),
                serde_json::json!({
                    "about": "Install the required debian packages",
                    "options": [],
                }),
            );
        } else {
            targets.insert(
                INSTALL_PACKAGES.to_string(),
                "Install the required debian packages".into(),
            );
        }

        for target in &self.targets {
            if verbose {
                let options: Vec<serde_json::Value> = target
                    .options
                    .iter()
                    .map(|opt| match opt.default_value() {
                        None => serde_json::json!({"name": opt.name, "required": true}),
                        Some(default) => serde_json::json!({
                            "name": opt.name,
                            "required": false,
                            "default-value": default.to_json(),
                        }),
                    })
                    .collect();

                targets.insert(
                    target.name.clone(),
                    serde_json::json!({"about": target.about, "options": options}),
                );
            } else {
                targets.insert(target.name.clone(), target.about.clone().into());
            }
        }

        let preludes: serde_json::Map<String, serde_json::Value> = self
            .preludes
            .iter()
            .map(|p| (p.name.clone(), p.about.clone().into()))
            .collect();

        let mut result = serde_json::Map::new();
        result.insert("preludes".to_string(), preludes.into());
        result.insert("targets".to_string(), targets.into());

        if let Some(prelude) = &self.default_prelude {
            result.insert("default-prelude".to_string(), prelude.clone().into());
        }

        if let Some(ubuntu) = self.config_toml.get("ubuntu") {
            match serde_json::to_value(ubuntu) {
                Ok(value) => {
                    result.insert("ubuntu".to_string(), value);
                }
                Err(err) => tracing::warn!("Cannot convert [ubuntu] section: {}", err),
            }
        }

        result.into()
    }

    pub fn has_parent(&self) -> bool {
        self.parent_name.is_some()
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent_name.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The folder containing the configuration folder.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn prelude_path(&self, script: &str) -> PathBuf {
        self.base_path.join(&self.name).join(PRELUDE_FOLDER).join(script)
    }

    fn target_bash_path(&self, script: &str) -> PathBuf {
        self.base_path.join(&self.name).join(TARGET_FOLDER).join(script)
    }

    fn target_python_path(&self, script: &str) -> PathBuf {
        let file_name = format!("{}.py", script.to_lowercase().replace('-', "_"));
        self.base_path
            .join(&self.name)
            .join(TARGET_FOLDER)
            .join(file_name)
    }

    pub fn default_prelude(&self) -> Option<&str> {
        self.default_prelude.as_deref()
    }

    pub fn prelude_names(&self) -> Vec<&str> {
        self.preludes.iter().map(Prelude::name).collect()
    }

    pub fn preludes(&self) -> &[Prelude] {
        &self.preludes
    }

    pub fn get_prelude(&self, name: &str) -> Option<&Prelude> {
        self.preludes.iter().find(|p| p.name == name)
    }

    /// The prelude script as a command line prefix.
    pub fn get_prelude_cmd(&self, name: &str) -> Result<String> {
        self.get_prelude(name)
            .ok_or_else(|| WkeError::config(format!("No such prelude: {}", name)))?
            .command()
    }

    pub fn get_target(&self, target_name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == target_name)
    }

    /// The contents of a target's script.
    pub fn get_target_cmd(&self, target_name: &str) -> Result<String> {
        let target = self
            .get_target(target_name)
            .ok_or_else(|| WkeError::config(format!("No such target: {}", target_name)))?;

        if target.path.is_none() {
            let search_paths = [
                self.target_bash_path(target_name),
                self.target_python_path(target_name),
            ];
            return Err(WkeError::config(format!(
                "For target \"{}\" no valid script exists at any of these locations: {:?}",
                target_name, search_paths
            )));
        }

        target.command()
    }

    pub fn get_target_args(&self, target_name: &str) -> Result<&[TargetOption]> {
        self.get_target(target_name)
            .map(Target::options)
            .ok_or_else(|| WkeError::config(format!("No such target: {}", target_name)))
    }

    fn ubuntu_list(&self, key: &str) -> Vec<String> {
        self.config_toml
            .get("ubuntu")
            .and_then(|ubuntu| ubuntu.get(key))
            .and_then(toml::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(toml::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Additional apt repositories this configuration needs.
    pub fn required_ubuntu_repositories(&self) -> Vec<String> {
        self.ubuntu_list("required-repositories")
    }

    /// Debian packages needed to run this configuration.
    pub fn required_ubuntu_packages(&self) -> Vec<String> {
        self.ubuntu_list("required-packages")
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(Target::name).collect()
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }
}

/// Deep-merges `child` into `parent`: tables merge, everything else replaces.
fn override_config(parent: &mut toml::Table, child: &toml::Table) {
    for (key, value) in child {
        if let (Some(toml::Value::Table(existing)), toml::Value::Table(overrides)) =
            (parent.get_mut(key), value)
        {
            override_config(existing, overrides);
            continue;
        }
        parent.insert(key.clone(), value.clone());
    }
}
