use indexmap::IndexMap;
use serde_json::Value;

const DEFAULT_MESSAGE: &str = "Error de Facturama";
const SUBMIT_FAILED: &str = "Error al timbrar factura";

/// Facturama 错误体
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetails {
    None,
    /// JSON 错误体: `Message`/`message` + `ModelState`
    Structured {
        message: Option<String>,
        model_state: IndexMap<String, Vec<String>>,
        raw: Value,
    },
    /// 非 JSON 错误体或网络错误描述
    Text(String),
}

impl ErrorDetails {
    /// 解析错误响应体; 非 JSON 当作纯文本
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(raw @ Value::Object(_)) => Self::from_json(raw),
            Ok(Value::String(s)) => Self::text(s),
            Ok(other) => Self::text(other.to_string()),
            Err(_) => Self::text(body.to_string()),
        }
    }

    fn text(s: String) -> Self {
        if s.trim().is_empty() {
            Self::None
        } else {
            Self::Text(s)
        }
    }

    fn from_json(raw: Value) -> Self {
        let message = ["Message", "message"]
            .iter()
            .filter_map(|k| raw.get(*k).and_then(Value::as_str))
            .find(|m| !m.is_empty())
            .map(str::to_string);

        let mut model_state = IndexMap::new();
        if let Some(Value::Object(map)) = raw.get("ModelState") {
            for (field, vals) in map {
                let messages = match vals {
                    Value::Array(list) => list.iter().map(value_text).collect(),
                    other => vec![value_text(other)],
                };
                model_state.insert(field.clone(), messages);
            }
        }

        Self::Structured {
            message,
            model_state,
            raw,
        }
    }

    /// 序列化保存到发票记录
    pub fn to_json(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Structured { raw, .. } => raw.clone(),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 外部服务调用失败 (非 2xx 或网络错误)
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    pub status: Option<u16>,
    pub message: String,
    pub details: ErrorDetails,
}

impl GatewayError {
    /// 根据 HTTP 状态与响应体构造, 消息优先取 JSON 的 Message
    pub fn from_response(status: u16, body: &str) -> Self {
        let details = ErrorDetails::from_body(body);
        let message = match &details {
            ErrorDetails::Structured {
                message: Some(m), ..
            } => m.clone(),
            ErrorDetails::Text(t) => t.clone(),
            _ => DEFAULT_MESSAGE.to_string(),
        };
        Self {
            status: Some(status),
            message,
            details,
        }
    }

    /// 网络层失败 (超时/连接失败)
    pub fn transport(cause: impl ToString) -> Self {
        Self {
            status: None,
            message: "No se pudo contactar Facturama".to_string(),
            details: ErrorDetails::Text(cause.to_string()),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            details: ErrorDetails::None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    /// 面向用户的错误列表: 概要 -> Message -> 字段级错误
    pub fn user_messages(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match &self.details {
            ErrorDetails::Structured {
                message,
                model_state,
                ..
            } => {
                if let Some(m) = message {
                    errors.push(m.clone());
                }
                for (field, messages) in model_state {
                    for m in messages {
                        errors.push(format!("{field}: {m}"));
                    }
                }
            }
            ErrorDetails::Text(t) => errors.push(t.clone()),
            ErrorDetails::None => {}
        }
        if errors.is_empty() {
            errors.push(self.message.clone());
        }

        let headline = match self.status {
            Some(code) => format!("{SUBMIT_FAILED} (HTTP {code})"),
            None => SUBMIT_FAILED.to_string(),
        };
        errors.insert(0, headline);
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_body_flattens_in_order() {
        let body = r#"{"Message":"RFC invalido","ModelState":{"Receiver.Rfc":["formato incorrecto"]}}"#;
        let err = GatewayError::from_response(400, body);

        assert_eq!(err.message, "RFC invalido");
        assert_eq!(
            err.user_messages(),
            vec![
                "Error al timbrar factura (HTTP 400)",
                "RFC invalido",
                "Receiver.Rfc: formato incorrecto",
            ]
        );
    }

    #[test]
    fn model_state_keeps_field_order_and_scalar_values() {
        let body = r#"{"message":"datos invalidos","ModelState":{"Z.Campo":["uno","dos"],"A.Campo":"solo"}}"#;
        let err = GatewayError::from_response(422, body);

        assert_eq!(
            err.user_messages(),
            vec![
                "Error al timbrar factura (HTTP 422)",
                "datos invalidos",
                "Z.Campo: uno",
                "Z.Campo: dos",
                "A.Campo: solo",
            ]
        );
    }

    #[test]
    fn plain_text_body_becomes_message() {
        let err = GatewayError::from_response(500, "Internal Server Error");
        assert_eq!(err.message, "Internal Server Error");
        assert_eq!(
            err.user_messages(),
            vec!["Error al timbrar factura (HTTP 500)", "Internal Server Error"]
        );
    }

    #[test]
    fn empty_body_uses_default_message() {
        let err = GatewayError::from_response(503, "");
        assert_eq!(err.message, "Error de Facturama");
        assert_eq!(err.details, ErrorDetails::None);
        assert_eq!(
            err.user_messages(),
            vec!["Error al timbrar factura (HTTP 503)", "Error de Facturama"]
        );
    }

    #[test]
    fn json_without_message_keeps_default() {
        let err = GatewayError::from_response(400, r#"{"ModelState":{"Folio":["duplicado"]}}"#);
        assert_eq!(err.message, "Error de Facturama");
        assert_eq!(
            err.user_messages(),
            vec!["Error al timbrar factura (HTTP 400)", "Folio: duplicado"]
        );
    }

    #[test]
    fn transport_error_has_no_status() {
        let err = GatewayError::transport("connection refused");
        assert_eq!(err.status, None);
        assert_eq!(
            err.user_messages(),
            vec!["Error al timbrar factura", "connection refused"]
        );
    }
}
