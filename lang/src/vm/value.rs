use crate::bytecode::Value;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ValueType {
    Int,
    Float,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Int => write!(f, "int"),
            ValueType::Float => write!(f, "float"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("could not convert to {r#type}: {value:?}")]
pub struct ConversionError {
    pub value: Value,
    pub r#type: ValueType,
}

impl TryInto<i64> for Value {
    type Error = ConversionError;
    fn try_into(self) -> Result<i64, Self::Error> {
        match self {
            Value::Int(i) => Ok(i),
            _ => Err(ConversionError {
                value: self,
                r#type: ValueType::Int,
            }),
        }
    }
}

impl TryInto<f64> for Value {
    type Error = ConversionError;
    fn try_into(self) -> Result<f64, Self::Error> {
        match self {
            Value::Float(f) => Ok(f),
            _ => Err(ConversionError {
                value: self,
                r#type: ValueType::Float,
            }),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Int(value as i64)
    }
}
