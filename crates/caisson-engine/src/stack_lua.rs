use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use caisson_domain::{
    AutoscalerSpec, DatabaseSpec, DeployContext, ImageSpec, ManifestSpec, OutputRef,
    PlaceholderToken, ResourceKind, ResourceName, ResourceSpec, SecretSpec, StackSpec,
    ValueSource,
};
use mlua::{Error as LuaError, Lua, MultiValue, Result as LuaResult, Table, Value};
use tracing::debug;

use crate::error::StackEvalError;
use crate::fs_util::resolve_stack_relative;

const REF_MARKER: &str = "__caisson_ref";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_IMAGE_TAG: &str = "latest";
const DEFAULT_DATABASE_ENGINE: &str = "mysql";
const DEFAULT_MYSQL_PORT: u16 = 3306;
const DEFAULT_POSTGRES_PORT: u16 = 5432;

#[derive(Debug, Default)]
struct StackCollector {
    context: Option<DeployContext>,
    resources: Vec<ResourceSpec>,
    exports: BTreeMap<String, ValueSource>,
}

impl StackCollector {
    fn push(&mut self, resource: ResourceSpec) -> LuaResult<()> {
        if self
            .resources
            .iter()
            .any(|existing| existing.name == resource.name)
        {
            return Err(LuaError::RuntimeError(format!(
                "resource \"{}\" is declared more than once",
                resource.name
            )));
        }
        self.resources.push(resource);
        Ok(())
    }
}

fn runtime_error(message: impl Into<String>) -> LuaError {
    LuaError::RuntimeError(message.into())
}

fn resource_name(raw: &str) -> LuaResult<ResourceName> {
    ResourceName::try_from(raw).map_err(|error| runtime_error(error.to_string()))
}

fn parse_string(opts: Option<&Table>, key: &str) -> LuaResult<Option<String>> {
    let Some(table) = opts else {
        return Ok(None);
    };

    match table.get::<Value>(key)? {
        Value::Nil => Ok(None),
        Value::String(value) => Ok(Some(value.to_str()?.to_owned())),
        _ => Err(runtime_error(format!("{key} must be a string"))),
    }
}

fn require_string(opts: Option<&Table>, key: &str, function: &str) -> LuaResult<String> {
    match parse_string(opts, key)? {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(runtime_error(format!(
            "{function} requires a non-empty `{key}` string"
        ))),
    }
}

fn parse_integer<T: TryFrom<i64>>(opts: Option<&Table>, key: &str, default: T) -> LuaResult<T> {
    let Some(table) = opts else {
        return Ok(default);
    };

    let raw = match table.get::<Value>(key)? {
        Value::Nil => return Ok(default),
        Value::Integer(value) => value,
        _ => return Err(runtime_error(format!("{key} must be an integer"))),
    };
    T::try_from(raw).map_err(|_| runtime_error(format!("{key} is out of range: {raw}")))
}

fn parse_depends_on(opts: Option<&Table>) -> LuaResult<Vec<ResourceName>> {
    let Some(table) = opts else {
        return Ok(Vec::new());
    };

    match table.get::<Value>("depends_on")? {
        Value::Nil => Ok(Vec::new()),
        Value::Table(names) => {
            let mut out = Vec::new();
            for value in names.sequence_values::<Value>() {
                let Value::String(text) = value? else {
                    return Err(runtime_error(
                        "depends_on must contain only resource name strings",
                    ));
                };
                out.push(resource_name(&text.to_str()?)?);
            }
            Ok(out)
        }
        _ => Err(runtime_error("depends_on must be a list of resource names")),
    }
}

fn parse_value(value: Value, what: &str) -> LuaResult<ValueSource> {
    match value {
        Value::String(text) => Ok(ValueSource::literal(text.to_str()?.to_owned())),
        Value::Integer(number) => Ok(ValueSource::literal(number.to_string())),
        Value::Number(number) => Ok(ValueSource::literal(number.to_string())),
        Value::Table(table) => {
            let Value::String(resource) = table.get::<Value>(REF_MARKER)? else {
                return Err(runtime_error(format!(
                    "{what} must be a string, a number, or ref(resource, field)"
                )));
            };
            let field: String = table.get("field")?;
            Ok(ValueSource::Ref(OutputRef {
                resource: resource_name(&resource.to_str()?)?,
                field,
            }))
        }
        _ => Err(runtime_error(format!(
            "{what} must be a string, a number, or ref(resource, field)"
        ))),
    }
}

fn parse_value_map(opts: Option<&Table>, key: &str) -> LuaResult<BTreeMap<String, ValueSource>> {
    let Some(table) = opts else {
        return Ok(BTreeMap::new());
    };

    match table.get::<Value>(key)? {
        Value::Nil => Ok(BTreeMap::new()),
        Value::Table(entries) => {
            let mut out = BTreeMap::new();
            for pair in entries.pairs::<Value, Value>() {
                let (entry_key, entry_value) = pair?;
                let Value::String(entry_key) = entry_key else {
                    return Err(runtime_error(format!("{key} keys must be strings")));
                };
                let entry_key = entry_key.to_str()?.to_owned();
                let parsed = parse_value(entry_value, &format!("{key}.{entry_key}"))?;
                out.insert(entry_key, parsed);
            }
            Ok(out)
        }
        _ => Err(runtime_error(format!("{key} must be a table"))),
    }
}

fn declare_context(
    collector: &Rc<RefCell<StackCollector>>,
    stack_dir: &Path,
    opts: &Table,
) -> LuaResult<DeployContext> {
    if collector.borrow().context.is_some() {
        return Err(runtime_error("stack { ... } may only be declared once"));
    }

    let opts = Some(opts);
    let context = DeployContext {
        stack: require_string(opts, "name", "stack { ... }")?,
        cluster: require_string(opts, "cluster", "stack { ... }")?,
        region: require_string(opts, "region", "stack { ... }")?,
        namespace: parse_string(opts, "namespace")?
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        kubeconfig: parse_string(opts, "kubeconfig")?
            .map(|raw| resolve_stack_relative(stack_dir, &raw)),
    };
    collector.borrow_mut().context = Some(context.clone());
    Ok(context)
}

fn add_image(
    collector: &Rc<RefCell<StackCollector>>,
    stack_dir: &Path,
    name: &str,
    opts: &Table,
) -> LuaResult<()> {
    let opts = Some(opts);
    let image = ImageSpec {
        repository: require_string(opts, "repository", "image(name, opts)")?,
        tag: parse_string(opts, "tag")?.unwrap_or_else(|| DEFAULT_IMAGE_TAG.to_string()),
        context: parse_string(opts, "context")?.map(|raw| resolve_stack_relative(stack_dir, &raw)),
        platform: parse_string(opts, "platform")?,
    };

    let mut resource = ResourceSpec::new(resource_name(name)?, ResourceKind::Image(image));
    resource.depends_on = parse_depends_on(opts)?;
    collector.borrow_mut().push(resource)
}

fn add_database(
    collector: &Rc<RefCell<StackCollector>>,
    sensitive: &Rc<RefCell<BTreeSet<String>>>,
    name: &str,
    opts: &Table,
) -> LuaResult<()> {
    let opts = Some(opts);
    let engine =
        parse_string(opts, "engine")?.unwrap_or_else(|| DEFAULT_DATABASE_ENGINE.to_string());
    let default_port = if engine.starts_with("postgres") {
        DEFAULT_POSTGRES_PORT
    } else {
        DEFAULT_MYSQL_PORT
    };
    let password = require_string(opts, "password", "database(name, opts)")?;
    sensitive.borrow_mut().insert(password.clone());

    let database = DatabaseSpec {
        db_name: require_string(opts, "db_name", "database(name, opts)")?,
        username: require_string(opts, "username", "database(name, opts)")?,
        password,
        port: parse_integer(opts, "port", default_port)?,
        endpoint: parse_string(opts, "endpoint")?,
        engine,
    };

    let mut resource = ResourceSpec::new(resource_name(name)?, ResourceKind::Database(database));
    resource.depends_on = parse_depends_on(opts)?;
    collector.borrow_mut().push(resource)
}

fn add_secret(collector: &Rc<RefCell<StackCollector>>, name: &str, opts: &Table) -> LuaResult<()> {
    let opts = Some(opts);
    let data = parse_value_map(opts, "data")?;
    if data.is_empty() {
        return Err(runtime_error(
            "secret(name, opts) requires a non-empty `data` table",
        ));
    }

    let mut resource =
        ResourceSpec::new(resource_name(name)?, ResourceKind::Secret(SecretSpec { data }));
    resource.depends_on = parse_depends_on(opts)?;
    collector.borrow_mut().push(resource)
}

fn add_manifest(
    collector: &Rc<RefCell<StackCollector>>,
    stack_dir: &Path,
    name: &str,
    template: &str,
    opts: Option<&Table>,
) -> LuaResult<()> {
    let mut substitutions = BTreeMap::new();
    for (token, value) in parse_value_map(opts, "substitutions")? {
        let token = PlaceholderToken::new(token).map_err(|error| runtime_error(error.to_string()))?;
        substitutions.insert(token, value);
    }

    let manifest = ManifestSpec {
        template: resolve_stack_relative(stack_dir, template),
        substitutions,
    };

    let mut resource = ResourceSpec::new(resource_name(name)?, ResourceKind::Manifest(manifest));
    resource.depends_on = parse_depends_on(opts)?;
    collector.borrow_mut().push(resource)
}

fn add_autoscaler(
    collector: &Rc<RefCell<StackCollector>>,
    name: &str,
    opts: &Table,
) -> LuaResult<()> {
    let opts = Some(opts);
    let autoscaler = AutoscalerSpec {
        target: require_string(opts, "target", "autoscaler(name, opts)")?,
        min_replicas: parse_integer(opts, "min_replicas", 1)?,
        max_replicas: parse_integer(opts, "max_replicas", 5)?,
        cpu_utilization: parse_integer(opts, "cpu_utilization", 50)?,
    };
    if autoscaler.min_replicas == 0 || autoscaler.min_replicas > autoscaler.max_replicas {
        return Err(runtime_error(format!(
            "autoscaler {name}: expected 1 <= min_replicas <= max_replicas, got {}..{}",
            autoscaler.min_replicas, autoscaler.max_replicas
        )));
    }
    if autoscaler.cpu_utilization == 0 || autoscaler.cpu_utilization > 100 {
        return Err(runtime_error(format!(
            "autoscaler {name}: cpu_utilization must be within 1..=100"
        )));
    }

    let mut resource =
        ResourceSpec::new(resource_name(name)?, ResourceKind::Autoscaler(autoscaler));
    resource.depends_on = parse_depends_on(opts)?;
    collector.borrow_mut().push(resource)
}

fn create_lua() -> LuaResult<Lua> {
    let lua = Lua::new();
    let globals = lua.globals();

    // Stack files only declare resources; filesystem and process access stays in Rust.
    for key in [
        "io", "os", "package", "debug", "dofile", "loadfile", "require",
    ] {
        globals.set(key, Value::Nil)?;
    }

    Ok(lua)
}

#[allow(clippy::too_many_lines)]
fn evaluate_stack_with_lua(
    stack_path: &Path,
    stack_dir: &Path,
    script: &str,
) -> LuaResult<(StackCollector, BTreeSet<String>)> {
    let collector = Rc::new(RefCell::new(StackCollector::default()));
    let sensitive_values: Rc<RefCell<BTreeSet<String>>> = Rc::new(RefCell::new(BTreeSet::new()));
    let lua = create_lua()?;
    let globals = lua.globals();

    {
        let sensitive = Rc::clone(&sensitive_values);
        let function = lua.create_function(move |_, args: MultiValue| {
            let Some(Value::String(name)) = args.front() else {
                return Err(runtime_error(
                    "env(name) expects exactly one string argument",
                ));
            };
            if args.len() != 1 {
                return Err(runtime_error(
                    "env(name) expects exactly one string argument",
                ));
            }

            let name = name.to_str()?.to_owned();
            env::var_os(&name).map_or_else(
                || {
                    Err(runtime_error(format!(
                        "env(\"{name}\") is not set in the current environment"
                    )))
                },
                |value| {
                    let resolved = value.to_string_lossy().into_owned();
                    sensitive.borrow_mut().insert(resolved.clone());
                    Ok(resolved)
                },
            )
        })?;
        globals.set("env", function)?;
    }

    {
        let function = lua.create_function(|lua, (resource, field): (String, String)| {
            let _ = resource_name(&resource)?;
            if field.trim().is_empty() {
                return Err(runtime_error("ref(resource, field) requires a field name"));
            }
            let table = lua.create_table()?;
            table.set(REF_MARKER, resource)?;
            table.set("field", field)?;
            Ok(table)
        })?;
        globals.set("ref", function)?;
    }

    {
        let collector = Rc::clone(&collector);
        let stack_dir = stack_dir.to_path_buf();
        let function = lua.create_function(move |lua, opts: Table| {
            let context = declare_context(&collector, &stack_dir, &opts)?;
            let table = lua.create_table()?;
            table.set("name", context.stack)?;
            table.set("cluster", context.cluster)?;
            table.set("region", context.region)?;
            table.set("namespace", context.namespace)?;
            if let Some(kubeconfig) = context.kubeconfig {
                table.set("kubeconfig", kubeconfig.to_string_lossy().into_owned())?;
            }
            Ok(table)
        })?;
        globals.set("stack", function)?;
    }

    {
        let collector = Rc::clone(&collector);
        let stack_dir = stack_dir.to_path_buf();
        let function = lua.create_function(move |_, (name, opts): (String, Table)| {
            add_image(&collector, &stack_dir, &name, &opts)
        })?;
        globals.set("image", function)?;
    }

    {
        let collector = Rc::clone(&collector);
        let sensitive = Rc::clone(&sensitive_values);
        let function = lua.create_function(move |_, (name, opts): (String, Table)| {
            add_database(&collector, &sensitive, &name, &opts)
        })?;
        globals.set("database", function)?;
    }

    {
        let collector = Rc::clone(&collector);
        let function = lua.create_function(move |_, (name, opts): (String, Table)| {
            add_secret(&collector, &name, &opts)
        })?;
        globals.set("secret", function)?;
    }

    {
        let collector = Rc::clone(&collector);
        let stack_dir = stack_dir.to_path_buf();
        let function = lua.create_function(
            move |_, (name, template, opts): (String, String, Option<Table>)| {
                add_manifest(&collector, &stack_dir, &name, &template, opts.as_ref())
            },
        )?;
        globals.set("manifest", function)?;
    }

    {
        let collector = Rc::clone(&collector);
        let function = lua.create_function(move |_, (name, opts): (String, Table)| {
            add_autoscaler(&collector, &name, &opts)
        })?;
        globals.set("autoscaler", function)?;
    }

    {
        let collector = Rc::clone(&collector);
        let function = lua.create_function(move |_, (name, value): (String, Value)| {
            if name.trim().is_empty() {
                return Err(runtime_error("export(name, value) requires a name"));
            }
            let value = parse_value(value, &format!("export {name}"))?;
            let mut collector = collector.borrow_mut();
            if collector.exports.contains_key(&name) {
                return Err(runtime_error(format!(
                    "export \"{name}\" is declared more than once"
                )));
            }
            collector.exports.insert(name, value);
            Ok(())
        })?;
        globals.set("export", function)?;
    }

    lua.load(script)
        .set_name(stack_path.to_string_lossy())
        .exec()?;

    let collector = std::mem::take(&mut *collector.borrow_mut());
    let sensitive = sensitive_values.borrow().clone();
    Ok((collector, sensitive))
}

/// Evaluate a stack file into a stack declaration plus the sensitive values
/// it read.
///
/// # Errors
///
/// Returns an error when the stack file cannot be read or evaluated, or when
/// it does not declare `stack { ... }`.
pub fn evaluate_stack(path: &Path) -> Result<(StackSpec, BTreeSet<String>), StackEvalError> {
    let stack_path = fs::canonicalize(path).map_err(|source| StackEvalError::CanonicalizePath {
        path: path.to_path_buf(),
        source,
    })?;
    let stack_dir = stack_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| StackEvalError::MissingStackParent {
            path: stack_path.clone(),
        })?;

    let script = fs::read_to_string(&stack_path).map_err(|source| StackEvalError::ReadStack {
        path: stack_path.clone(),
        source,
    })?;

    let (collector, sensitive) = evaluate_stack_with_lua(&stack_path, &stack_dir, &script)
        .map_err(|source| StackEvalError::LuaRuntime {
            path: stack_path.clone(),
            source,
        })?;

    let Some(context) = collector.context else {
        return Err(StackEvalError::MissingContext { path: stack_path });
    };

    debug!(
        stack = %stack_path.display(),
        resources = collector.resources.len(),
        exports = collector.exports.len(),
        "evaluated stack"
    );

    Ok((
        StackSpec {
            path: stack_path,
            context,
            resources: collector.resources,
            exports: collector.exports,
        },
        sensitive,
    ))
}
