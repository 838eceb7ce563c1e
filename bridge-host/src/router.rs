//! Command routing.
//!
//! [`CommandRouter::handle`] takes one [`ClientRequest`] from a session and
//! always produces a [`ClientReply`]. Failures of any kind, including a
//! panicking handler, come back as an error reply.
//!
//! Commands without a dedicated handler are forwarded to the agent with
//! their payload unchanged.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use signbridge_core::{rounds, Restriction, DEFAULT_BATCH_CHUNK};
use signbridge_relay::DeviceSyncManager;
use signbridge_types::{BridgeError, ClientReply, ClientRequest, SessionId, Thumbprint};
use tracing::{debug, info, warn};

use crate::authorization::AuthorizationGate;
use crate::blocklist::BlockListService;
use crate::dispatch::{CallOptions, Dispatcher};
use crate::session::{ClientSession, PathKind};
use crate::store::SettingsStore;

/// Agent is installed and answering.
pub const STATUS_INSTALLED: u8 = 0;
/// Agent could not be reached.
pub const STATUS_NATIVE_NOT_INSTALLED: u8 = 3;
/// Agent predates `getInfo`.
pub const STATUS_NATIVE_OUTDATED: u8 = 4;

const SUPPORTED_OS: [&str; 3] = ["Windows", "Linux", "Darwin"];

/// Router settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Reported by `getExtensionVersion`.
    pub extension_version: String,
    /// Hashes signed per `signHashBatch` round.
    pub batch_chunk: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            extension_version: env!("CARGO_PKG_VERSION").to_string(),
            batch_chunk: DEFAULT_BATCH_CHUNK,
        }
    }
}

/// Routes client commands to their handlers.
pub struct CommandRouter {
    dispatcher: Dispatcher,
    gate: AuthorizationGate,
    blocklist: Arc<BlockListService>,
    settings: Arc<dyn SettingsStore>,
    config: RouterConfig,
}

impl CommandRouter {
    /// Create a router.
    pub fn new(
        dispatcher: Dispatcher,
        gate: AuthorizationGate,
        blocklist: Arc<BlockListService>,
        settings: Arc<dyn SettingsStore>,
        config: RouterConfig,
    ) -> Self {
        Self {
            dispatcher,
            gate,
            blocklist,
            settings,
            config,
        }
    }

    /// The dispatcher used for agent calls.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Handle one request.
    pub async fn handle(&self, session: &ClientSession, request: ClientRequest) -> ClientReply {
        session.apply_request_options(&request);
        let ClientRequest {
            request_id,
            command,
            request: payload,
            ..
        } = request;

        let domain = session.domain().as_str();
        let result = if self.blocklist.is_restricted(domain, Restriction::Forbidden) {
            warn!(%domain, %command, "request from blocked domain");
            self.blocklist.refresh_soon();
            Err(BridgeError::BlockedDomain {
                domain: domain.to_string(),
            })
        } else {
            debug!(client = %session.id(), %command, "handling command");
            AssertUnwindSafe(self.execute(session, &command, payload))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(BridgeError::Internal(format!(
                        "An unhandled exception occurred: {}",
                        panic_message(panic.as_ref())
                    )))
                })
        };

        if let Err(e) = &result {
            debug!(client = %session.id(), %command, code = e.code(), error = %e, "command failed");
        }
        ClientReply::from_result(request_id, result)
    }

    async fn execute(
        &self,
        session: &ClientSession,
        command: &str,
        request: Value,
    ) -> Result<Value, BridgeError> {
        match command {
            "initialize" => self.initialize(session).await,
            "getExtensionVersion" => Ok(json!(self.config.extension_version)),

            "showFolderBrowser" => self.show_folder_browser(session, &request).await,
            "showFileBrowser" => self.show_file_browser(session, request).await,
            "openFolder" => self.open_path(session, command, &request, PathKind::Folder).await,
            "openFile" => self.open_path(session, command, &request, PathKind::File).await,
            "downloadToFolder" => self.download_to_folder(session, &request).await,

            "readCertificate" => self.read_certificate(session, &request).await,
            "signData" => self.sign_simple(session, command, &request, "data").await,
            "signHash" => self.sign_simple(session, command, &request, "hash").await,
            "keySignData" => self.key_sign(session, command, &request, "data").await,
            "keySignHash" => self.key_sign(session, command, &request, "hash").await,
            "signHashBatch" => self.sign_hash_batch(session, &request).await,
            "signPdf" => self.sign_document(session, command, &request).await,
            "signCades" => self.sign_document(session, command, &request).await,
            "signXml" => self.sign_document(session, command, &request).await,
            "openPades" | "openCades" | "openXmlSignature" => {
                self.open_signature(session, command, &request).await
            }
            "preauthorizeSignatures" => self.preauthorize(session, &request).await,
            "removeCertificate" => self.remove_certificate(session, request).await,

            "generateTokenRsaKeyPair" => self.generate_token_key_pair(session, request).await,
            "generateSoftwareRsaKeyPair" => {
                required(&request, "keySize")?;
                self.call(session, command, request).await
            }
            "importTokenCertificate" => self.import_token_certificate(session, request).await,
            "importCertificate" => {
                required(&request, "certificateContent")?;
                self.call(session, command, request).await
            }
            "sendAuthenticatedRequest" => {
                for name in ["certificateThumbprint", "method", "url"] {
                    required(&request, name)?;
                }
                self.call(session, command, request).await
            }

            "startSyncDevice" => self.start_sync_device().await,
            "waitSyncDevice" => self.wait_sync_device(&request, false).await,
            "finishSyncDevice" => self.wait_sync_device(&request, true).await,
            "refreshDevice" => self.refresh_device(&request).await,

            _ => self.call(session, command, request).await,
        }
    }

    async fn call(
        &self,
        session: &ClientSession,
        command: &str,
        request: Value,
    ) -> Result<Value, BridgeError> {
        self.dispatcher
            .call(session, command, request, CallOptions::default())
            .await
    }

    // ===========================================
    // Setup
    // ===========================================

    async fn initialize(&self, session: &ClientSession) -> Result<Value, BridgeError> {
        let info = self
            .call(session, "getInfo", json!({"cancelInstances": false}))
            .await;
        match info {
            Ok(info) => {
                let os = info["os"].as_str().unwrap_or_default();
                if !SUPPORTED_OS.contains(&os) {
                    return Err(BridgeError::UnsupportedOs { os: os.to_string() });
                }
                info!(%os, version = %info["version"], "agent ready");
                Ok(json!({
                    "isReady": true,
                    "status": STATUS_INSTALLED,
                    "nativeInfo": {"os": os, "installedVersion": info["version"]},
                }))
            }
            Err(BridgeError::NativeDisconnected { .. } | BridgeError::NativeConnectFailed(_)) => {
                Ok(json!({
                    "isReady": false,
                    "status": STATUS_NATIVE_NOT_INSTALLED,
                    "message": "The signing agent is not installed",
                }))
            }
            Err(e) if e.code().eq_ignore_ascii_case("command_unknown") => Ok(json!({
                "isReady": false,
                "status": STATUS_NATIVE_OUTDATED,
                "message": "The signing agent is outdated",
            })),
            Err(e) => Err(e),
        }
    }

    // ===========================================
    // Files and folders
    // ===========================================

    async fn show_folder_browser(
        &self,
        session: &ClientSession,
        request: &Value,
    ) -> Result<Value, BridgeError> {
        let response = self
            .call(session, "showFolderBrowser", json!({"message": request["message"]}))
            .await?;
        if is_true(&response["userCancelled"]) {
            return Ok(json!({"userCancelled": true}));
        }
        let path = response["path"].as_str().unwrap_or_default();
        Ok(json!({
            "userCancelled": false,
            "folderId": session.register_path(path),
        }))
    }

    async fn show_file_browser(
        &self,
        session: &ClientSession,
        request: Value,
    ) -> Result<Value, BridgeError> {
        let response = self.call(session, "showFileBrowser", request).await?;
        if is_true(&response["userCancelled"]) {
            return Ok(json!({"userCancelled": true}));
        }
        let mut reply = json!({"userCancelled": false});
        if let Some(files) = response["files"].as_array() {
            let files: Vec<Value> = files
                .iter()
                .map(|file| {
                    json!({
                        "id": session.register_path(file["path"].as_str().unwrap_or_default()),
                        "name": file["name"],
                        "length": file["length"],
                    })
                })
                .collect();
            reply["files"] = Value::Array(files);
        }
        Ok(reply)
    }

    async fn open_path(
        &self,
        session: &ClientSession,
        command: &str,
        request: &Value,
        kind: PathKind,
    ) -> Result<Value, BridgeError> {
        let path = resolve_handle(session, request, kind)?;
        self.call(session, command, Value::String(path)).await?;
        Ok(Value::Null)
    }

    async fn download_to_folder(
        &self,
        session: &ClientSession,
        request: &Value,
    ) -> Result<Value, BridgeError> {
        let url = required(request, "url")?;
        let folder = resolve_handle(session, required(request, "folderId")?, PathKind::Folder)?;
        self.call(
            session,
            "downloadToFolder",
            json!({
                "url": url,
                "folderPath": folder,
                "filename": request["filename"],
            }),
        )
        .await
    }

    // ===========================================
    // Certificates and signing
    // ===========================================

    async fn read_certificate(
        &self,
        session: &ClientSession,
        request: &Value,
    ) -> Result<Value, BridgeError> {
        let thumbprint = thumbprint(request)?;
        if let Some(content) = self.settings.cached_certificate(&thumbprint).await? {
            debug!(%thumbprint, "using cached certificate");
            return Ok(content);
        }
        let content = self
            .call(
                session,
                "readCertificate",
                json!({"certificateThumbprint": thumbprint.as_str()}),
            )
            .await?;
        self.settings
            .cache_certificate(&thumbprint, content.clone())
            .await?;
        Ok(content)
    }

    async fn sign_simple(
        &self,
        session: &ClientSession,
        command: &str,
        request: &Value,
        payload: &str,
    ) -> Result<Value, BridgeError> {
        let thumbprint = thumbprint(request)?;
        let call = pick(request, &["certificateThumbprint", payload, "digestAlgorithm"]);
        self.gate
            .authorize(&self.dispatcher, session, &thumbprint, 1)
            .await?;
        self.call(session, command, Value::Object(call)).await
    }

    async fn key_sign(
        &self,
        session: &ClientSession,
        command: &str,
        request: &Value,
        payload: &str,
    ) -> Result<Value, BridgeError> {
        required(request, "privateKeyId")?;
        let call = pick(
            request,
            &[
                "privateKeyId",
                payload,
                "digestAlgorithm",
                "pkcs11Modules",
                "tokenSerialNumber",
            ],
        );
        self.call(session, command, Value::Object(call)).await
    }

    async fn sign_hash_batch(
        &self,
        session: &ClientSession,
        request: &Value,
    ) -> Result<Value, BridgeError> {
        let batch = required(request, "batch")?
            .as_array()
            .ok_or_else(|| BridgeError::missing("batch"))?;
        let thumbprint = thumbprint(request)?;
        let total = batch.len() as u64;

        self.gate
            .authorize(&self.dispatcher, session, &thumbprint, total)
            .await?;
        session.grant_credit(&thumbprint, total);

        let mut signatures = Vec::with_capacity(batch.len());
        for round in rounds(batch.len(), self.config.batch_chunk) {
            debug!(%thumbprint, start = round.start, end = round.end, "signing batch round");
            self.gate
                .authorize(&self.dispatcher, session, &thumbprint, round.len() as u64)
                .await?;
            let response = self
                .call(
                    session,
                    "signHashBatch",
                    json!({
                        "certificateThumbprint": thumbprint.as_str(),
                        "batch": &batch[round],
                        "digestAlgorithm": request["digestAlgorithm"],
                    }),
                )
                .await?;
            match response.get("signatures") {
                Some(Value::Array(round_signatures)) => {
                    signatures.extend(round_signatures.iter().cloned())
                }
                _ => {
                    return Err(BridgeError::Internal(
                        "agent returned no signatures for batch round".into(),
                    ))
                }
            }
        }
        Ok(json!({"signatures": signatures}))
    }

    async fn sign_document(
        &self,
        session: &ClientSession,
        command: &str,
        request: &Value,
    ) -> Result<Value, BridgeError> {
        let (file_type, extra): (&str, &[&str]) = match command {
            "signPdf" => ("PDF", &["visualRepresentation", "pdfMarks", "bypassMarksIfSigned"]),
            "signCades" => ("Data", &["includeEncapsulatedContent", "autoDetectCosign"]),
            _ => (
                "XML",
                &[
                    "namespaces",
                    "signatureElementId",
                    "signatureElementLocation",
                    "toSignElementId",
                    "toSignElementsIds",
                    "toSignElementsXPath",
                    "idResolutionTable",
                    "signerType",
                ],
            ),
        };

        let mut call = common_signer_request(session, request, file_type)?;
        if command == "signXml" {
            required(request, "signerType")?;
        }
        if command == "signCades" {
            let cosign = optional_path(session, request, "cmsToCosignFileId")?;
            call.insert("cmsToCosignFilePath".into(), cosign);
        }
        call.extend(pick(request, extra));

        let thumbprint = thumbprint(request)?;
        self.gate
            .authorize(&self.dispatcher, session, &thumbprint, 1)
            .await?;
        let response = self.call(session, command, Value::Object(call)).await?;
        self.document_result(session, response).await
    }

    /// Register a result path as a handle and inline buffered content.
    async fn document_result(
        &self,
        session: &ClientSession,
        mut response: Value,
    ) -> Result<Value, BridgeError> {
        let Some(file) = response
            .pointer_mut("/signatureInfo/file")
            .and_then(Value::as_object_mut)
        else {
            return Ok(response);
        };

        if let Some(path) = file.remove("path") {
            if let Some(path) = path.as_str().filter(|p| !p.is_empty()) {
                file.insert("id".into(), json!(session.register_path(path)));
            }
        }
        let stream_id = file.get("streamId").filter(|s| !is_blank(s)).cloned();
        let length = file.get("length").and_then(Value::as_u64).unwrap_or(0);

        let Some(stream_id) = stream_id else {
            return Ok(response);
        };

        info!(length, "reading buffered signature content");
        let content = self
            .read_buffered_content(session, &stream_id, length)
            .await?;
        if let Some(info) = response
            .get_mut("signatureInfo")
            .and_then(Value::as_object_mut)
        {
            info.insert("content".into(), json!(STANDARD.encode(content)));
            info.remove("file");
        }

        if let Err(e) = self
            .call(session, "finishBufferedContent", json!({"streamId": stream_id}))
            .await
        {
            warn!(error = %e, "could not release buffered content");
        }
        Ok(response)
    }

    async fn read_buffered_content(
        &self,
        session: &ClientSession,
        stream_id: &Value,
        length: u64,
    ) -> Result<Vec<u8>, BridgeError> {
        let mut content = Vec::new();
        let mut offset = 0u64;
        while offset < length {
            let chunk = self
                .call(
                    session,
                    "readBufferedContent",
                    json!({"streamId": stream_id, "offset": offset}),
                )
                .await?;
            let written = chunk["written"].as_u64().unwrap_or(0);
            let buffer = chunk["buffer"].as_str().filter(|_| written > 0).ok_or_else(|| {
                BridgeError::Internal(format!("buffered content stalled at offset {offset}"))
            })?;
            let bytes = STANDARD
                .decode(buffer)
                .map_err(|e| BridgeError::Internal(format!("invalid buffered content: {e}")))?;
            content.extend_from_slice(&bytes);
            offset += written;
        }
        debug!(length = offset, "buffered content read");
        Ok(content)
    }

    async fn open_signature(
        &self,
        session: &ClientSession,
        command: &str,
        request: &Value,
    ) -> Result<Value, BridgeError> {
        let file_type = match command {
            "openPades" => "PDF",
            "openCades" => "CAdES",
            _ => "XML",
        };
        if is_blank(&request["signatureFileId"]) && is_blank(&request["signatureContent"]) {
            return Err(BridgeError::ParameterMissing(format!(
                "A {file_type} fileId or content parameter must be passed"
            )));
        }

        let mut call = Map::new();
        call.insert(
            "signatureFilePath".into(),
            optional_path(session, request, "signatureFileId")?,
        );
        call.extend(pick(
            request,
            &[
                "signatureContent",
                "validate",
                "dateReference",
                "trustArbitrators",
                "clearPolicyTrustArbitrators",
                "specificPolicy",
            ],
        ));
        match command {
            "openCades" => {
                call.insert(
                    "originalFilePath".into(),
                    optional_path(session, request, "originalFileId")?,
                );
                call.extend(pick(request, &["originalContent", "acceptablePolicies"]));
            }
            "openXmlSignature" => {
                call.extend(pick(request, &["idResolutionTable", "acceptablePolicies"]));
            }
            _ => {}
        }
        self.call(session, command, Value::Object(call)).await
    }

    async fn preauthorize(
        &self,
        session: &ClientSession,
        request: &Value,
    ) -> Result<Value, BridgeError> {
        let thumbprint = thumbprint(request)?;
        let count = required(request, "signatureCount")?
            .as_u64()
            .ok_or_else(|| BridgeError::missing("signatureCount"))?;
        self.gate
            .preauthorize(&self.dispatcher, session, &thumbprint, count)
            .await?;
        Ok(Value::Null)
    }

    async fn remove_certificate(
        &self,
        session: &ClientSession,
        request: Value,
    ) -> Result<Value, BridgeError> {
        if !session.is_popup() {
            return Err(BridgeError::Forbidden(
                "removeCertificate is only available to the bridge UI".into(),
            ));
        }
        if is_blank(&request) {
            return Err(BridgeError::ParameterMissing("The request cannot be empty".into()));
        }
        self.call(session, "removeCertificate", request).await
    }

    // ===========================================
    // Keys and tokens
    // ===========================================

    async fn generate_token_key_pair(
        &self,
        session: &ClientSession,
        request: Value,
    ) -> Result<Value, BridgeError> {
        required(&request, "tokenSerialNumber")?;
        required(&request, "keySize")?;
        let response = self
            .call(session, "generateTokenRsaKeyPair", request.clone())
            .await?;
        self.learn_pkcs11_modules(&request, &response).await?;
        Ok(json!({
            "csr": response["csr"],
            "privateKeyId": response["privateKeyId"],
        }))
    }

    async fn import_token_certificate(
        &self,
        session: &ClientSession,
        request: Value,
    ) -> Result<Value, BridgeError> {
        required(&request, "tokenSerialNumber")?;
        required(&request, "certificateContent")?;
        let response = self
            .call(session, "importTokenCertificate", request.clone())
            .await?;
        self.learn_pkcs11_modules(&request, &response).await?;
        Ok(json!({"imported": response["imported"]}))
    }

    /// Remember the module the agent used, or else the ones the caller passed.
    async fn learn_pkcs11_modules(&self, request: &Value, response: &Value) -> Result<(), BridgeError> {
        let modules: Vec<String> = match response["pkcs11ModuleUsed"].as_str() {
            Some(used) if !used.is_empty() => vec![used.to_string()],
            _ => request["pkcs11Modules"]
                .as_array()
                .map(|modules| {
                    modules
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };
        if !modules.is_empty() {
            debug!(?modules, "learning PKCS#11 modules");
            self.settings.add_pkcs11_modules(&modules).await?;
        }
        Ok(())
    }

    // ===========================================
    // Remote devices
    // ===========================================

    fn devices(&self) -> Result<&DeviceSyncManager, BridgeError> {
        self.dispatcher
            .devices()
            .ok_or_else(|| BridgeError::Internal("remote devices are not available".into()))
    }

    async fn start_sync_device(&self) -> Result<Value, BridgeError> {
        let ticket = self.devices()?.start_pairing().await?;
        Ok(json!({
            "sessionId": ticket.session_id.as_str(),
            "sessionIdRaw": ticket.session_id_raw,
            "encodedX": ticket.encoded_x,
        }))
    }

    async fn wait_sync_device(&self, request: &Value, finish_sync: bool) -> Result<Value, BridgeError> {
        let devices = self.devices()?;
        let session_id = SessionId::new(required_str(request, "sessionId")?);
        devices.await_pending_device(&session_id, finish_sync).await?;
        if !finish_sync {
            return Ok(Value::Null);
        }

        let device = devices
            .connected_devices()
            .await
            .into_iter()
            .find(|d| d.session_id == session_id);
        Ok(match device {
            Some(d) => json!({
                "deviceId": d.device_id,
                "sessionId": d.session_id.as_str(),
                "name": d.name,
                "os": d.os,
                "enabled": d.enabled,
            }),
            None => Value::Null,
        })
    }

    async fn refresh_device(&self, request: &Value) -> Result<Value, BridgeError> {
        let devices = self.devices()?;
        if let Some(device_id) = request["deviceId"].as_str() {
            devices.refresh_device(device_id).await?;
        }
        Ok(Value::Null)
    }
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ===========================================
// Request helpers
// ===========================================

/// Whether a parameter counts as not given.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(_) => false,
    }
}

fn is_true(value: &Value) -> bool {
    !is_blank(value)
}

fn required<'a>(request: &'a Value, name: &str) -> Result<&'a Value, BridgeError> {
    request
        .get(name)
        .filter(|v| !is_blank(v))
        .ok_or_else(|| BridgeError::missing(name))
}

fn required_str<'a>(request: &'a Value, name: &str) -> Result<&'a str, BridgeError> {
    required(request, name)?
        .as_str()
        .ok_or_else(|| BridgeError::missing(name))
}

fn thumbprint(request: &Value) -> Result<Thumbprint, BridgeError> {
    required_str(request, "certificateThumbprint").map(Thumbprint::new)
}

/// Copy the named fields that are present.
fn pick(request: &Value, names: &[&str]) -> Map<String, Value> {
    names
        .iter()
        .filter_map(|name| request.get(*name).map(|v| (name.to_string(), v.clone())))
        .collect()
}

fn resolve_handle(
    session: &ClientSession,
    handle: &Value,
    kind: PathKind,
) -> Result<String, BridgeError> {
    match handle.as_str() {
        Some(handle) => session.resolve_path(handle, kind),
        None => Err(BridgeError::PathNotFound {
            kind: kind.as_str(),
            handle: handle.to_string(),
        }),
    }
}

/// Path for an optional file handle field, or null.
fn optional_path(session: &ClientSession, request: &Value, field: &str) -> Result<Value, BridgeError> {
    match request.get(field).filter(|v| !is_blank(v)) {
        Some(handle) => Ok(Value::String(resolve_handle(session, handle, PathKind::File)?)),
        None => Ok(Value::Null),
    }
}

/// Fields shared by `signPdf`, `signCades` and `signXml`.
fn common_signer_request(
    session: &ClientSession,
    request: &Value,
    file_type: &str,
) -> Result<Map<String, Value>, BridgeError> {
    let thumbprint = required_str(request, "certificateThumbprint")?;
    if is_blank(&request["fileId"]) && is_blank(&request["content"]) {
        return Err(BridgeError::ParameterMissing(format!(
            "A {file_type} fileId or content parameter must be passed"
        )));
    }
    let file_path = optional_path(session, request, "fileId")?;

    let output = &request["output"];
    let folder_path = match output.get("folderId").filter(|v| !is_blank(v)) {
        Some(handle) => Value::String(resolve_handle(session, handle, PathKind::Folder)?),
        None => Value::Null,
    };
    let mut output_call = pick(output, &["mode", "dialogTitle", "fileNameSuffix"]);
    output_call.insert("folderPath".into(), folder_path);

    let mut call = Map::new();
    call.insert("certificateThumbprint".into(), json!(thumbprint));
    call.insert("filePath".into(), file_path);
    call.insert("output".into(), Value::Object(output_call));
    call.extend(pick(
        request,
        &[
            "content",
            "trustArbitrators",
            "clearPolicyTrustArbitrators",
            "certificateValidationLevel",
            "policy",
        ],
    ));
    Ok(call)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
