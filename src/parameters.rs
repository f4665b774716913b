//! Parameter Manager (C5): typed named runtime tunables with constraints
//! and change callbacks (§3.5, §4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::events::EventEmitter;
use crate::value::{Value, ValueType};

pub fn parameter_type_to_string(t: ValueType) -> &'static str {
    match t {
        ValueType::Double => "double",
        ValueType::Int64 => "int64",
        ValueType::Uint64 => "uint64",
        ValueType::Bool => "bool",
        ValueType::String => "string",
        ValueType::Bytes => "bytes",
    }
}

/// Round-trips on exactly the four valid parameter type strings named in §8;
/// `bytes` is a legal `Value` variant but not a legal parameter type.
pub fn parameter_type_from_string(s: &str) -> Option<ValueType> {
    match s {
        "double" => Some(ValueType::Double),
        "int64" => Some(ValueType::Int64),
        "uint64" => Some(ValueType::Uint64),
        "bool" => Some(ValueType::Bool),
        "string" => Some(ValueType::String),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct NumericBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ParameterDef {
    pub name: String,
    pub type_tag: ValueType,
    pub value: Value,
    pub bounds: Option<NumericBounds>,
    pub allowed: Option<Vec<String>>,
}

type ParamCallback = Box<dyn Fn(&str, &Value, &Value) + Send + Sync>;

pub struct ParameterManager {
    params: Mutex<HashMap<String, ParameterDef>>,
    callbacks: Mutex<Vec<ParamCallback>>,
    emitter: Option<Arc<EventEmitter>>,
}

impl Default for ParameterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterManager {
    pub fn new() -> Self {
        Self {
            params: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            emitter: None,
        }
    }

    pub fn with_emitter(emitter: Arc<EventEmitter>) -> Self {
        Self {
            params: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            emitter: Some(emitter),
        }
    }

    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &Value, &Value) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Idempotent by name; a redefinition attempt fails (§4.4).
    pub fn define(
        &self,
        name: &str,
        type_tag: ValueType,
        default: Value,
        bounds: Option<NumericBounds>,
        allowed: Option<Vec<String>>,
    ) -> Result<(), String> {
        if default.type_tag() != type_tag {
            return Err(format!(
                "default value type {:?} does not match declared type {:?}",
                default.type_tag(),
                type_tag
            ));
        }
        let mut params = self.params.lock().unwrap();
        if params.contains_key(name) {
            return Err(format!("parameter '{name}' already defined"));
        }
        params.insert(
            name.to_string(),
            ParameterDef {
                name: name.to_string(),
                type_tag,
                value: default,
                bounds,
                allowed,
            },
        );
        Ok(())
    }

    fn validate(def: &ParameterDef, value: &Value) -> Result<Value, String> {
        let coerced = value
            .coerce_to(def.type_tag)
            .ok_or_else(|| format!("value type {:?} is not compatible with {:?}", value.type_tag(), def.type_tag))?;

        if let Some(bounds) = &def.bounds {
            if let Some(n) = coerced.as_f64() {
                if let Some(min) = bounds.min {
                    if n < min {
                        return Err(format!("value {n} below minimum {min}"));
                    }
                }
                if let Some(max) = bounds.max {
                    if n > max {
                        return Err(format!("value {n} above maximum {max}"));
                    }
                }
            }
        }

        if let (Some(allowed), Value::String(s)) = (&def.allowed, &coerced) {
            if !allowed.iter().any(|a| a == s) {
                return Err(format!("value '{s}' is not in the allowed set {allowed:?}"));
            }
        }

        Ok(coerced)
    }

    /// Validates type match and constraints; only emits a change if the new
    /// variant compares non-equal to the old (§4.4).
    pub fn set(&self, name: &str, value: Value) -> Result<(), String> {
        let (old, new) = {
            let mut params = self.params.lock().unwrap();
            let def = params
                .get_mut(name)
                .ok_or_else(|| format!("unknown parameter '{name}'"))?;
            let coerced = Self::validate(def, &value)?;
            if coerced == def.value {
                return Ok(());
            }
            let old = def.value.clone();
            def.value = coerced.clone();
            (old, coerced)
        };

        if let Some(emitter) = &self.emitter {
            emitter.emit_parameter_change(name);
        }
        for cb in self.callbacks.lock().unwrap().iter() {
            cb(name, &old, &new);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.params.lock().unwrap().get(name).map(|d| d.value.clone())
    }

    /// Typed convenience accessor; falls back to `default` on miss or type
    /// mismatch (§4.4).
    pub fn get_double(&self, name: &str, default: f64) -> f64 {
        match self.get(name) {
            Some(Value::Double(v)) => v,
            _ => default,
        }
    }

    pub fn get_int64(&self, name: &str, default: i64) -> i64 {
        match self.get(name) {
            Some(Value::Int64(v)) => v,
            _ => default,
        }
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(Value::Bool(v)) => v,
            _ => default,
        }
    }

    pub fn get_string(&self, name: &str, default: &str) -> String {
        match self.get(name) {
            Some(Value::String(v)) => v,
            _ => default.to_string(),
        }
    }
}
