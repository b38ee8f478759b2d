use std::collections::HashMap;

use crate::error::Error;

/// Alpaca request parameters.
///
/// Alpaca parameter names are case insensitive, so keys are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlpacaParams(HashMap<String, String>);

impl From<HashMap<String, String>> for AlpacaParams {
    fn from(raw: HashMap<String, String>) -> Self {
        Self(
            raw.into_iter()
                .map(|(key, value)| (key.to_lowercase(), value))
                .collect(),
        )
    }
}

impl AlpacaParams {
    /// A parameter by name, any case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_lowercase()).map(String::as_str)
    }

    fn required(&self, name: &str) -> Result<&str, Error> {
        self.get(name)
            .ok_or_else(|| Error::InvalidValue(format!("Missing parameter `{name}`")))
    }

    /// The client's transaction id, if it sent a usable one.
    pub fn client_transaction_id(&self) -> Option<u32> {
        self.get("ClientTransactionID")?.trim().parse().ok()
    }

    /// The `Id` parameter, a switch id.
    pub fn id(&self) -> Result<i64, Error> {
        let raw = self.required("Id")?;

        raw.trim()
            .parse()
            .map_err(|_| Error::InvalidValue(format!("`{raw}` is not a valid switch id")))
    }

    /// A required floating point parameter.
    pub fn f64(&self, name: &str) -> Result<f64, Error> {
        let raw = self.required(name)?;

        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| Error::InvalidValue(format!("`{raw}` is not a valid {name}")))
    }

    /// A required boolean parameter, `true` or `false` in any case.
    pub fn bool(&self, name: &str) -> Result<bool, Error> {
        let raw = self.required(name)?;

        match raw.trim().to_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(Error::InvalidValue(format!("`{raw}` is not a valid {name}"))),
        }
    }

    /// A required string parameter.
    pub fn string(&self, name: &str) -> Result<&str, Error> {
        self.required(name)
    }
}
