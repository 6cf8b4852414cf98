//! Payload generation through the team server build endpoint.

use base64::Engine;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// A payload built by the server for a registered builder.
#[derive(Debug)]
pub struct BuiltPayload {
    /// Suggested file name for saving the binary
    pub filename: String,
    /// Decoded payload binary
    pub payload: Vec<u8>,
    /// Build context handed back to the builder extension
    pub context: Value,
}

/// Request a payload build from the server.
///
/// `name` is the registered builder/agent type, `config` the configuration
/// the builder generated. A non-200 with a parsable `{error}` surfaces that
/// message; a 200 body must carry `filename`, a base64 `payload` and a
/// `context` object.
pub async fn build(transport: &Transport, name: &str, config: &Value) -> Result<BuiltPayload> {
    let request = json!({
        "name": name,
        "config": config,
    });

    let (status, bytes) = transport.send("/api/agent/build", &request, false).await?;

    if status != 200 {
        return Err(Error::from_error_body(&bytes, "failed to build payload"));
    }

    let object: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Protocol(format!("build response: {}", e)))?;

    let filename = object
        .get("filename")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("build response: invalid filename".to_string()))?
        .to_string();

    let encoded = object
        .get("payload")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("build response: invalid payload".to_string()))?;

    let context = object
        .get("context")
        .filter(|c| c.is_object())
        .cloned()
        .ok_or_else(|| Error::Protocol("build response: invalid context".to_string()))?;

    let payload = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::Protocol(format!("build response: payload is not base64: {}", e)))?;

    Ok(BuiltPayload {
        filename,
        payload,
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpResponse, HttpServer};

    async fn spawn_build_server() -> String {
        let server = HttpServer::new(|| {
            App::new().route(
                "/api/agent/build",
                web::post().to(|body: web::Json<Value>| async move {
                    match body["name"].as_str() {
                        Some("raven") => HttpResponse::Ok().json(json!({
                            "filename": "raven.x64.exe",
                            "payload": base64::engine::general_purpose::STANDARD.encode(b"MZ-payload"),
                            "context": { "arch": "x64" },
                        })),
                        Some("broken") => HttpResponse::Ok().json(json!({
                            "filename": "broken.exe",
                            "payload": "%%% not base64 %%%",
                            "context": {},
                        })),
                        _ => HttpResponse::NotFound().json(json!({
                            "error": "unknown builder",
                        })),
                    }
                }),
            )
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());

        format!("http://{}", addr)
    }

    #[actix_web::test]
    async fn test_build_decodes_payload() {
        let base = spawn_build_server().await;
        let transport = Transport::with_base(base).unwrap();

        let built = build(&transport, "raven", &json!({ "sleep": 5 }))
            .await
            .unwrap();

        assert_eq!(built.filename, "raven.x64.exe");
        assert_eq!(built.payload, b"MZ-payload");
        assert_eq!(built.context["arch"], "x64");
    }

    #[actix_web::test]
    async fn test_build_surfaces_server_error() {
        let base = spawn_build_server().await;
        let transport = Transport::with_base(base).unwrap();

        let err = build(&transport, "missing", &json!({})).await.unwrap_err();

        match err {
            Error::Server(message) => assert_eq!(message, "unknown builder"),
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[actix_web::test]
    async fn test_build_rejects_malformed_payload() {
        let base = spawn_build_server().await;
        let transport = Transport::with_base(base).unwrap();

        let err = build(&transport, "broken", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
