//! YAML configuration with dotted-key lookup.
//!
//! Keys address nested mappings with dots, so `swf.window_limit` reads
//!
//! ```yaml
//! swf:
//!   window_limit: 10
//! ```
//!
//! Matrices are written either as `{rows, cols, data}` with row-major `data`,
//! or as a flat row-major list.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use nalgebra::{DMatrix, Matrix4};
use yaml_rust::{Yaml, YamlLoader};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("I/O Error: {0}")]
    IOError(String),
    #[error("Yaml Error: {0}")]
    YamlError(String),
    #[error("Missing configuration key: {0}")]
    MissingKey(String),
    #[error("Invalid value for `{key}`: expected {expected}")]
    InvalidValue { key: String, expected: &'static str },
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for ConfigError {
    fn from(err: yaml_rust::ScanError) -> Self {
        ConfigError::YamlError(err.to_string())
    }
}

fn invalid(key: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        expected,
    }
}

/// Reads integers as well as reals, since `500` and `500.0` are both valid.
fn yaml_f64(node: &Yaml) -> Option<f64> {
    match node {
        Yaml::Real(_) => node.as_f64(),
        Yaml::Integer(i) => Some(*i as f64),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    doc: Yaml,
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        let mut docs = YamlLoader::load_from_str(contents)?;
        if docs.is_empty() {
            return Err(ConfigError::YamlError("Empty YAML document".to_string()));
        }
        Ok(Config {
            doc: docs.swap_remove(0),
        })
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    fn lookup(&self, key: &str) -> Option<&Yaml> {
        let node = key
            .split('.')
            .try_fold(&self.doc, |node, part| match &node[part] {
                Yaml::BadValue => None,
                child => Some(child),
            })?;
        Some(node)
    }

    fn node(&self, key: &str) -> Result<&Yaml, ConfigError> {
        self.lookup(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, ConfigError> {
        yaml_f64(self.node(key)?).ok_or_else(|| invalid(key, "a number"))
    }

    pub fn get_usize(&self, key: &str) -> Result<usize, ConfigError> {
        self.node(key)?
            .as_i64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| invalid(key, "a non-negative integer"))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        self.node(key)?
            .as_bool()
            .ok_or_else(|| invalid(key, "a boolean"))
    }

    pub fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        self.node(key)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| invalid(key, "a string"))
    }

    pub fn get_vec_f64(&self, key: &str) -> Result<Vec<f64>, ConfigError> {
        self.node(key)?
            .as_vec()
            .ok_or_else(|| invalid(key, "a list of numbers"))?
            .iter()
            .map(|v| yaml_f64(v).ok_or_else(|| invalid(key, "a list of numbers")))
            .collect()
    }

    pub fn get_vec_usize(&self, key: &str) -> Result<Vec<usize>, ConfigError> {
        self.node(key)?
            .as_vec()
            .ok_or_else(|| invalid(key, "a list of integers"))?
            .iter()
            .map(|v| {
                v.as_i64()
                    .and_then(|i| usize::try_from(i).ok())
                    .ok_or_else(|| invalid(key, "a list of integers"))
            })
            .collect()
    }

    /// Reads a `{rows, cols, data}` matrix with row-major `data`.
    pub fn get_matrix(&self, key: &str) -> Result<DMatrix<f64>, ConfigError> {
        let rows = self.get_usize(&format!("{key}.rows"))?;
        let cols = self.get_usize(&format!("{key}.cols"))?;
        let data = self.get_vec_f64(&format!("{key}.data"))?;
        if data.len() != rows * cols {
            return Err(invalid(key, "rows * cols data values"));
        }
        Ok(DMatrix::from_row_slice(rows, cols, &data))
    }

    /// Reads a homogeneous transform, either as a 4x4 matrix mapping or a flat
    /// list of 16 row-major values.
    pub fn get_matrix4(&self, key: &str) -> Result<Matrix4<f64>, ConfigError> {
        let data = match self.node(key)? {
            Yaml::Hash(_) => {
                let m = self.get_matrix(key)?;
                if m.shape() != (4, 4) {
                    return Err(invalid(key, "a 4x4 matrix"));
                }
                return Ok(Matrix4::from_iterator(m.iter().copied()));
            }
            Yaml::Array(_) => self.get_vec_f64(key)?,
            _ => return Err(invalid(key, "a 4x4 matrix")),
        };
        if data.len() != 16 {
            return Err(invalid(key, "a 4x4 matrix"));
        }
        Ok(Matrix4::from_row_slice(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SAMPLE: &str = r#"
swf:
  window_limit: 10
solver:
  max_iter: 5
  lambda: 0.001
  verbose: true
  marg_type: "drop"
cam0:
  resolution: [640, 480]
  proj_params: [458, 457.3, 367.2, 248.3]
T_SC0:
  rows: 4
  cols: 4
  data: [
    0.0, -1.0, 0.0, 0.1,
    1.0, 0.0, 0.0, 0.2,
    0.0, 0.0, 1.0, 0.3,
    0.0, 0.0, 0.0, 1.0
  ]
T_SC1: [1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 1]
"#;

    #[test]
    fn test_dotted_lookup() {
        let config: Config = SAMPLE.parse().unwrap();
        assert_eq!(config.get_usize("swf.window_limit").unwrap(), 10);
        assert_relative_eq!(config.get_f64("solver.lambda").unwrap(), 0.001);
        assert!(config.get_bool("solver.verbose").unwrap());
        assert_eq!(config.get_string("solver.marg_type").unwrap(), "drop");
        assert_eq!(config.get_vec_usize("cam0.resolution").unwrap(), vec![640, 480]);
        // Integers are accepted where reals are expected.
        assert_eq!(
            config.get_vec_f64("cam0.proj_params").unwrap(),
            vec![458.0, 457.3, 367.2, 248.3]
        );
        assert!(config.has_key("cam0"));
        assert!(!config.has_key("cam1"));
        assert!(!config.has_key("swf.window_limit.extra"));
    }

    #[test]
    fn test_matrix_formats() {
        let config: Config = SAMPLE.parse().unwrap();
        let t_sc0 = config.get_matrix4("T_SC0").unwrap();
        assert_eq!(t_sc0[(0, 1)], -1.0);
        assert_eq!(t_sc0[(1, 0)], 1.0);
        assert_eq!(t_sc0[(2, 3)], 0.3);
        assert_eq!(config.get_matrix4("T_SC1").unwrap(), Matrix4::identity());
    }

    #[test]
    fn test_errors() {
        let config: Config = SAMPLE.parse().unwrap();
        assert_eq!(
            config.get_f64("imu0.rate"),
            Err(ConfigError::MissingKey("imu0.rate".to_string()))
        );
        assert!(matches!(
            config.get_usize("solver.lambda"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.get_matrix4("cam0.resolution"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            "a: [1, 2".parse::<Config>(),
            Err(ConfigError::YamlError(_))
        ));
        assert!(matches!(
            Config::load("does/not/exist.yaml"),
            Err(ConfigError::IOError(_))
        ));
    }
}
