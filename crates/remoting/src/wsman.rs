//! Minimal WS-Management shell client.
//!
//! Implements the six Windows Remote Shell actions both transports need:
//! Create, Command, Send, Receive, Signal and Delete. Envelopes are rendered
//! with `format!` and responses are read by locating the few elements of
//! interest, which keeps the client free of a full XML stack.
//!
//! `basic` credentials go out on every request. `ntlm` and `negotiate` run an
//! NTLM handshake once per connection and, on `http` endpoints, seal every
//! envelope with the negotiated session keys.

use std::{fmt::Write as _, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{
    Client, RequestBuilder, Response, StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE},
};
use uuid::Uuid;

use crate::{
    config::TransportConfig,
    credentials::{AuthScheme, Credentials, RemoteTarget},
    encryption,
    error::{RemotingError, Result},
    ntlm::{NtlmClient, SessionSecurity},
};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const CMD_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// Room left in a Send envelope for everything but the base64 stream.
const SEND_ENVELOPE_OVERHEAD: usize = 4096;

/// Fault code returned when a Receive found no output within the operation timeout.
const TIMED_OUT_CODE: &str = "2150858793";

/// Output collected by one or more Receive calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub done: bool,
}

impl CommandOutput {
    fn absorb(&mut self, chunk: CommandOutput) {
        self.stdout.extend_from_slice(&chunk.stdout);
        self.stderr.extend_from_slice(&chunk.stderr);
        if chunk.exit_code.is_some() {
            self.exit_code = chunk.exit_code;
        }
        self.done = chunk.done;
    }
}

enum Reply {
    Body(String),
    TimedOut,
}

/// Per-client authentication state.
#[derive(Clone)]
enum Auth {
    Basic,
    /// Security context of the pooled connection, set once the handshake
    /// has completed.
    Ntlm { context: Arc<tokio::sync::Mutex<Option<SessionSecurity>>>, encrypt: bool },
}

/// HTTP client bound to one WS-Management endpoint.
#[derive(Clone)]
pub(crate) struct WsManClient {
    http: Client,
    endpoint: String,
    credentials: Credentials,
    config: TransportConfig,
    auth: Auth,
}

impl std::fmt::Debug for WsManClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsManClient")
            .field("endpoint", &self.endpoint)
            .field("username", &self.credentials.username())
            .field("scheme", &self.credentials.scheme())
            .finish_non_exhaustive()
    }
}

impl WsManClient {
    /// Builds a client for `target`.
    ///
    /// `basic`, `ntlm` and `negotiate` are available; other schemes fail here
    /// so the session reports the problem on `connect`.
    pub fn new(target: &RemoteTarget, config: &TransportConfig) -> Result<Self> {
        let auth = match target.credentials.scheme() {
            AuthScheme::Basic => Auth::Basic,
            AuthScheme::Ntlm | AuthScheme::Negotiate => {
                Auth::Ntlm { context: Arc::default(), encrypt: !target.use_tls }
            },
            other => return Err(RemotingError::unsupported_auth(other.as_str())),
        };

        // An NTLM context belongs to a single connection.
        let http = Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs())
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| RemotingError::connection_with_source("failed to build HTTP client", e))?;

        Ok(Self {
            http,
            endpoint: target.endpoint(),
            credentials: target.credentials.clone(),
            config: config.clone(),
            auth,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Opens a cmd shell and returns its id.
    pub async fn create_shell(&self) -> Result<String> {
        let options = format!(
            r#"<w:OptionSet>
      <w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>
      <w:Option Name="WINRS_CODEPAGE">{}</w:Option>
    </w:OptionSet>"#,
            self.config.codepage()
        );
        let body = r"<rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>";

        let reply = self.post(&self.envelope(ACTION_CREATE, None, &options, body)).await?;
        let xml = expect_body(reply, "Create")?;
        element_text(&xml, "ShellId")
            .map(str::to_owned)
            .ok_or_else(|| RemotingError::transport_failure("Create response carries no ShellId"))
    }

    /// Starts `command` in the shell and returns the command id.
    ///
    /// With `console_stdin` unset the command reads stdin as a plain pipe
    /// rather than a console.
    pub async fn command(&self, shell_id: &str, command: &str, args: &[&str], console_stdin: bool) -> Result<String> {
        let options = format!(
            r#"<w:OptionSet>
      <w:Option Name="WINRS_CONSOLEMODE_STDIN">{}</w:Option>
      <w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>
    </w:OptionSet>"#,
            if console_stdin { "TRUE" } else { "FALSE" }
        );
        let mut body = format!("<rsp:CommandLine><rsp:Command>{}</rsp:Command>", xml_escape(command));
        for arg in args {
            let _ = write!(body, "<rsp:Arguments>{}</rsp:Arguments>", xml_escape(arg));
        }
        body.push_str("</rsp:CommandLine>");

        let reply = self.post(&self.envelope(ACTION_COMMAND, Some(shell_id), &options, &body)).await?;
        let xml = expect_body(reply, "Command")?;
        element_text(&xml, "CommandId")
            .map(str::to_owned)
            .ok_or_else(|| RemotingError::transport_failure("Command response carries no CommandId"))
    }

    /// Writes `data` to the command's stdin.
    pub async fn send_input(&self, shell_id: &str, command_id: &str, data: &[u8], end: bool) -> Result<()> {
        let body = format!(
            r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{command_id}"{}>{}</rsp:Stream></rsp:Send>"#,
            if end { r#" End="true""# } else { "" },
            STANDARD.encode(data)
        );
        let reply = self.post(&self.envelope(ACTION_SEND, Some(shell_id), "", &body)).await?;
        expect_body(reply, "Send").map(|_| ())
    }

    /// Writes `data` to stdin using as many Sends as the envelope size needs.
    pub async fn send_stream(&self, shell_id: &str, command_id: &str, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(send_chunk_len(self.config.max_envelope_size())) {
            self.send_input(shell_id, command_id, chunk, false).await?;
        }
        Ok(())
    }

    /// Performs one Receive. A timed-out Receive yields an empty, unfinished chunk.
    pub async fn receive(&self, shell_id: &str, command_id: &str) -> Result<CommandOutput> {
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#
        );
        match self.post(&self.envelope(ACTION_RECEIVE, Some(shell_id), "", &body)).await? {
            Reply::Body(xml) => Ok(parse_receive(&xml)),
            Reply::TimedOut => Ok(CommandOutput::default()),
        }
    }

    /// Receives until the command reports `Done`.
    pub async fn receive_all(&self, shell_id: &str, command_id: &str) -> Result<CommandOutput> {
        let mut output = CommandOutput::default();
        while !output.done {
            let chunk = self.receive(shell_id, command_id).await?;
            output.absorb(chunk);
        }
        Ok(output)
    }

    /// Terminates a command. Failures are logged, not returned.
    pub async fn signal_terminate(&self, shell_id: &str, command_id: &str) {
        let body = format!(
            r#"<rsp:Signal CommandId="{command_id}"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"#
        );
        if let Err(err) = self.post(&self.envelope(ACTION_SIGNAL, Some(shell_id), "", &body)).await {
            tracing::debug!(shell_id, command_id, error = %err, "Signal terminate failed");
        }
    }

    /// Deletes the shell.
    pub async fn delete_shell(&self, shell_id: &str) -> Result<()> {
        let reply = self.post(&self.envelope(ACTION_DELETE, Some(shell_id), "", "")).await?;
        expect_body(reply, "Delete").map(|_| ())
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
        let selector = shell_id
            .map(|id| {
                format!(r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#, xml_escape(id))
            })
            .unwrap_or_default();
        let body = if body.is_empty() { "<s:Body/>".to_owned() } else { format!("<s:Body>{body}</s:Body>") };

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{endpoint}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{CMD_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo><a:Address s:mustUnderstand="true">{ANONYMOUS}</a:Address></a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{max_envelope}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{timeout}</w:OperationTimeout>
    {selector}
    {options}
  </s:Header>
  {body}
</s:Envelope>"#,
            endpoint = xml_escape(&self.endpoint),
            message_id = Uuid::new_v4(),
            max_envelope = self.config.max_envelope_size(),
            timeout = iso8601_duration(self.config.operation_timeout()),
        )
    }

    async fn post(&self, envelope: &str) -> Result<Reply> {
        match &self.auth {
            Auth::Basic => {
                let request = self
                    .http
                    .post(&self.endpoint)
                    .basic_auth(self.credentials.username(), Some(self.credentials.secret()))
                    .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                    .body(envelope.to_owned());
                let response = self.send(request).await?;
                let status = response.status();
                let body = read_body(response).await?;
                self.reply(status, String::from_utf8_lossy(&body).into_owned())
            },
            Auth::Ntlm { context, encrypt } => {
                let mut context = context.lock().await;
                let mut reauthenticated = false;
                loop {
                    if context.is_none() {
                        *context = Some(self.handshake().await?);
                    }
                    let Some(security) = context.as_mut() else {
                        return Err(RemotingError::connection("NTLM context missing after handshake"));
                    };
                    let (status, text) = self.post_with_context(security, *encrypt, envelope).await?;
                    if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                        tracing::debug!(endpoint = %self.endpoint, "NTLM context rejected, authenticating again");
                        *context = None;
                        reauthenticated = true;
                        continue;
                    }
                    return self.reply(status, text);
                }
            },
        }
    }

    async fn post_with_context(
        &self,
        security: &mut SessionSecurity,
        encrypt: bool,
        envelope: &str,
    ) -> Result<(StatusCode, String)> {
        let request = self.http.post(&self.endpoint);
        let request = if encrypt {
            request.header(CONTENT_TYPE, encryption::content_type()).body(encryption::seal_body(security, envelope)?)
        } else {
            request.header(CONTENT_TYPE, SOAP_CONTENT_TYPE).body(envelope.to_owned())
        };

        let response = self.send(request).await?;
        let status = response.status();
        let sealed = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(encryption::is_encrypted);
        let body = read_body(response).await?;

        let text = if sealed && !body.is_empty() {
            encryption::unseal_body(security, &body)?
        } else {
            String::from_utf8_lossy(&body).into_owned()
        };
        Ok((status, text))
    }

    /// Runs the NEGOTIATE / CHALLENGE / AUTHENTICATE exchange on an empty
    /// request body.
    async fn handshake(&self) -> Result<SessionSecurity> {
        let ntlm = NtlmClient::new(&self.credentials);

        let request = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, negotiate_header(ntlm.negotiate()))
            .body(Vec::new());
        let response = self.send(request).await?;
        let challenge = challenge_token(&response).ok_or_else(|| {
            RemotingError::connection(format!(
                "{} did not offer NTLM authentication (status {})",
                self.endpoint,
                response.status()
            ))
        })?;
        read_body(response).await?;

        let (authenticate, security) = ntlm.authenticate(&challenge)?;
        let request = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, negotiate_header(&authenticate))
            .body(Vec::new());
        let response = self.send(request).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RemotingError::connection(format!("{} rejected the credentials", self.endpoint)));
        }
        read_body(response).await?;

        tracing::debug!(endpoint = %self.endpoint, username = self.credentials.username(), "NTLM authentication completed");
        Ok(security)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| RemotingError::transport_failure_with_source("WS-Management request failed", e))
    }

    fn reply(&self, status: StatusCode, text: String) -> Result<Reply> {
        if status.is_success() {
            return Ok(Reply::Body(text));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(RemotingError::connection(format!("{} rejected the credentials", self.endpoint)));
        }
        if is_timed_out_fault(&text) {
            return Ok(Reply::TimedOut);
        }
        let fault = element_text(&text, "Text").unwrap_or("no fault text");
        Err(RemotingError::transport_failure(format!("WS-Management fault ({status}): {fault}")))
    }
}

async fn read_body(response: Response) -> Result<bytes::Bytes> {
    response
        .bytes()
        .await
        .map_err(|e| RemotingError::transport_failure_with_source("failed to read WS-Management reply", e))
}

fn negotiate_header(token: &[u8]) -> String {
    format!("Negotiate {}", STANDARD.encode(token))
}

/// The NTLM token of a `WWW-Authenticate: Negotiate <token>` challenge.
fn challenge_token(response: &Response) -> Option<Vec<u8>> {
    response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| value.strip_prefix("Negotiate ").or_else(|| value.strip_prefix("NTLM ")))
        .and_then(|token| STANDARD.decode(token.trim()).ok())
}

fn expect_body(reply: Reply, action: &str) -> Result<String> {
    match reply {
        Reply::Body(xml) => Ok(xml),
        Reply::TimedOut => Err(RemotingError::transport_failure(format!("{action} timed out"))),
    }
}

fn is_timed_out_fault(xml: &str) -> bool {
    xml.contains(TIMED_OUT_CODE) || xml.contains("w:TimedOut")
}

/// Raw stdin bytes whose base64 form fits one Send envelope.
fn send_chunk_len(max_envelope_size: u32) -> usize {
    ((max_envelope_size as usize).saturating_sub(SEND_ENVELOPE_OVERHEAD) / 4 * 3).max(3)
}

/// `xs:duration` with millisecond precision, e.g. `PT60.000S`.
pub(crate) fn iso8601_duration(duration: Duration) -> String {
    format!("PT{}.{:03}S", duration.as_secs(), duration.subsec_millis())
}

pub(crate) fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Text of the first element whose local name is `name`, ignoring the prefix.
pub(crate) fn element_text<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let mut search = 0;
    while let Some(found) = xml[search..].find(name) {
        let start = search + found;
        let end = start + name.len();
        search = end;

        let before = xml[..start].rfind(['<', '>', ' ', '"'])?;
        if xml.as_bytes()[before] != b'<' || xml[before + 1..start].contains(['/', ' ']) {
            continue;
        }
        let prefix_ok = start == before + 1 || xml[before + 1..start].ends_with(':');
        let after = xml[end..].chars().next();
        if !prefix_ok || !matches!(after, Some('>' | ' ')) {
            continue;
        }

        let open_end = end + xml[end..].find('>')?;
        if xml[..open_end].ends_with('/') {
            return Some("");
        }
        let content_start = open_end + 1;
        let content_end = content_start + xml[content_start..].find("</")?;
        return Some(&xml[content_start..content_end]);
    }
    None
}

fn parse_receive(xml: &str) -> CommandOutput {
    let mut output = CommandOutput {
        done: xml.contains("CommandState/Done"),
        exit_code: element_text(xml, "ExitCode").and_then(|code| code.trim().parse().ok()),
        ..CommandOutput::default()
    };

    let mut search = 0;
    while let Some(found) = xml[search..].find("Stream Name=\"") {
        let name_start = search + found + "Stream Name=\"".len();
        let Some(name_len) = xml[name_start..].find('"') else { break };
        let stream = &xml[name_start..name_start + name_len];

        let Some(tag_len) = xml[name_start..].find('>') else { break };
        let tag_end = name_start + tag_len;
        search = tag_end;
        if xml[..tag_end].ends_with('/') {
            continue;
        }

        let content_start = tag_end + 1;
        let Some(content_len) = xml[content_start..].find("</") else { break };
        let content = xml[content_start..content_start + content_len].trim();
        search = content_start + content_len;
        if content.is_empty() {
            continue;
        }

        let Ok(decoded) = STANDARD.decode(content) else {
            tracing::debug!(stream, "Skipping undecodable stream chunk");
            continue;
        };
        match stream {
            "stdout" => output.stdout.extend_from_slice(&decoded),
            "stderr" => output.stderr.extend_from_slice(&decoded),
            _ => {},
        }
    }
    output
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_element_text_ignores_prefix() {
        let xml = "<s:Body><rsp:Shell><rsp:ShellId>ABC-123</rsp:ShellId></rsp:Shell></s:Body>";
        assert_eq!(element_text(xml, "ShellId"), Some("ABC-123"));
        assert_eq!(element_text("<ShellId>x</ShellId>", "ShellId"), Some("x"));
        assert_eq!(element_text(xml, "CommandId"), None);
    }

    #[test]
    fn test_element_text_skips_attribute_matches() {
        let xml = r#"<w:Selector Name="ShellId">S1</w:Selector><rsp:ShellId>S2</rsp:ShellId>"#;
        assert_eq!(element_text(xml, "ShellId"), Some("S2"));
    }

    #[test]
    fn test_parse_receive_collects_streams() {
        let xml = format!(
            r#"<rsp:ReceiveResponse>
<rsp:Stream Name="stdout" CommandId="C">{}</rsp:Stream>
<rsp:Stream Name="stderr" CommandId="C">{}</rsp:Stream>
<rsp:Stream Name="stdout" CommandId="C">{}</rsp:Stream>
<rsp:Stream Name="stdout" CommandId="C" End="true"></rsp:Stream>
<rsp:Stream Name="stderr" CommandId="C" End="true"/>
<rsp:CommandState CommandId="C" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">
<rsp:ExitCode>3</rsp:ExitCode></rsp:CommandState>
</rsp:ReceiveResponse>"#,
            STANDARD.encode("hello "),
            STANDARD.encode("oops"),
            STANDARD.encode("world"),
        );
        let output = parse_receive(&xml);
        assert_eq!(output.stdout, b"hello world");
        assert_eq!(output.stderr, b"oops");
        assert_eq!(output.exit_code, Some(3));
        assert!(output.done);
    }

    #[test]
    fn test_parse_receive_running() {
        let xml = r#"<rsp:CommandState CommandId="C" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/>"#;
        let output = parse_receive(xml);
        assert!(!output.done);
        assert_eq!(output.exit_code, None);
    }

    #[test]
    fn test_timed_out_fault_detection() {
        let fault = r#"<s:Fault><s:Code><s:Subcode><s:Value>w:TimedOut</s:Value></s:Subcode></s:Code>
<s:Detail><f:WSManFault Code="2150858793"/></s:Detail></s:Fault>"#;
        assert!(is_timed_out_fault(fault));
        assert!(!is_timed_out_fault("<s:Fault><s:Text>Access denied</s:Text></s:Fault>"));
    }

    #[test]
    fn test_iso8601_duration() {
        assert_eq!(iso8601_duration(Duration::from_secs(60)), "PT60.000S");
        assert_eq!(iso8601_duration(Duration::from_millis(1500)), "PT1.500S");
    }

    #[test]
    fn test_send_chunks_fit_the_envelope() {
        for max in [crate::config::MIN_MAX_ENVELOPE_SIZE, crate::config::DEFAULT_MAX_ENVELOPE_SIZE] {
            let len = send_chunk_len(max);
            assert_eq!(len % 3, 0);
            assert!(STANDARD.encode(vec![0u8; len]).len() + SEND_ENVELOPE_OVERHEAD <= max as usize);
        }
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape(r#"a<b & "c""#), "a&lt;b &amp; &quot;c&quot;");
    }

    fn target(scheme: AuthScheme, use_tls: bool) -> RemoteTarget {
        RemoteTarget::new("ca", if use_tls { 5986 } else { 5985 }, use_tls, Credentials::new(r"CORP\u", "p", scheme))
    }

    #[test]
    fn test_unavailable_schemes_are_unsupported() {
        for scheme in [AuthScheme::Kerberos, AuthScheme::CredSsp, AuthScheme::Certificate] {
            let err = WsManClient::new(&target(scheme, false), &TransportConfig::default()).unwrap_err();
            assert!(matches!(err, RemotingError::UnsupportedAuth { scheme: ref name } if name == scheme.as_str()));
        }
    }

    #[test]
    fn test_default_scheme_builds_a_client() {
        for scheme in [AuthScheme::default(), AuthScheme::Ntlm, AuthScheme::Basic] {
            let client = WsManClient::new(&target(scheme, false), &TransportConfig::default()).unwrap();
            assert_eq!(client.endpoint(), "http://ca:5985/wsman");
        }
    }

    #[test]
    fn test_ntlm_encrypts_only_without_tls() {
        let plain = WsManClient::new(&target(AuthScheme::Negotiate, false), &TransportConfig::default()).unwrap();
        assert!(matches!(plain.auth, Auth::Ntlm { encrypt: true, .. }));
        let tls = WsManClient::new(&target(AuthScheme::Negotiate, true), &TransportConfig::default()).unwrap();
        assert!(matches!(tls.auth, Auth::Ntlm { encrypt: false, .. }));
    }

    // -----------------------------------------------------------------------
    // Loopback exchanges
    // -----------------------------------------------------------------------

    use crate::{
        loopback::{LoopbackRequest, LoopbackResponse, LoopbackServer},
        ntlm::acceptor,
    };

    const SERVER_CHALLENGE: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

    fn loopback_target(port: u16, scheme: AuthScheme) -> RemoteTarget {
        RemoteTarget::new("127.0.0.1", port, false, Credentials::new(r"CORP\svc", "pw", scheme))
    }

    /// A WinRM host answering NTLM and sealed envelopes. The first
    /// `rejections` sealed requests are refused with 401.
    fn ntlm_host(mut rejections: usize) -> impl FnMut(&LoopbackRequest) -> LoopbackResponse + Send {
        let mut context: Option<SessionSecurity> = None;
        move |request: &LoopbackRequest| {
            if let Some(token) = request.header("Authorization").and_then(|value| value.strip_prefix("Negotiate ")) {
                let token = STANDARD.decode(token).unwrap();
                if token[8] == 1 {
                    let challenge = acceptor::challenge(acceptor::GRANTED_FLAGS, SERVER_CHALLENGE, &[]);
                    return LoopbackResponse::empty(401)
                        .with_header("WWW-Authenticate", format!("Negotiate {}", STANDARD.encode(challenge)));
                }
                context = Some(acceptor::accept(&token, &SERVER_CHALLENGE, "pw").unwrap());
                return LoopbackResponse::empty(200);
            }
            if rejections > 0 {
                rejections -= 1;
                context = None;
                return LoopbackResponse::empty(401);
            }
            let Some(security) = context.as_mut() else {
                return LoopbackResponse::empty(401);
            };

            let envelope = encryption::unseal_body(security, &request.body).unwrap();
            let reply = if envelope.contains(ACTION_CREATE) {
                "<s:Body><rsp:Shell><rsp:ShellId>SHELL-9</rsp:ShellId></rsp:Shell></s:Body>"
            } else {
                "<s:Body/>"
            };
            LoopbackResponse {
                status: 200,
                headers: vec![("Content-Type".to_owned(), encryption::content_type())],
                body: encryption::seal_body(security, reply).unwrap(),
            }
        }
    }

    #[tokio::test]
    async fn test_ntlm_handshake_then_sealed_messages() {
        let server = LoopbackServer::start(ntlm_host(0)).await;
        let client =
            WsManClient::new(&loopback_target(server.port, AuthScheme::Negotiate), &TransportConfig::default()).unwrap();

        assert_eq!(client.create_shell().await.unwrap(), "SHELL-9");
        client.delete_shell("SHELL-9").await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 4);
        assert!(requests[..2].iter().all(|request| request.body.is_empty()));
        for sealed in &requests[2..] {
            assert!(sealed.header("Content-Type").is_some_and(encryption::is_encrypted));
            assert!(!sealed.body_text().contains("ws/2004/09/transfer"));
        }
    }

    #[tokio::test]
    async fn test_rejected_context_authenticates_again() {
        let server = LoopbackServer::start(ntlm_host(1)).await;
        let client =
            WsManClient::new(&loopback_target(server.port, AuthScheme::Ntlm), &TransportConfig::default()).unwrap();

        assert_eq!(client.create_shell().await.unwrap(), "SHELL-9");
        assert_eq!(server.requests().len(), 6);
    }

    #[tokio::test]
    async fn test_persistent_rejection_is_a_connection_error() {
        let server = LoopbackServer::start(ntlm_host(usize::MAX)).await;
        let client =
            WsManClient::new(&loopback_target(server.port, AuthScheme::Ntlm), &TransportConfig::default()).unwrap();

        let err = client.create_shell().await.unwrap_err();
        assert!(matches!(err, RemotingError::Connection { .. }));
        assert_eq!(server.requests().len(), 6);
    }

    #[tokio::test]
    async fn test_basic_sends_plain_envelopes() {
        let server = LoopbackServer::replay(vec![LoopbackResponse::soap(
            200,
            "<s:Body><rsp:Shell><rsp:ShellId>SHELL-1</rsp:ShellId></rsp:Shell></s:Body>",
        )])
        .await;
        let client =
            WsManClient::new(&loopback_target(server.port, AuthScheme::Basic), &TransportConfig::default()).unwrap();

        assert_eq!(client.create_shell().await.unwrap(), "SHELL-1");
        let requests = server.requests();
        assert!(requests[0].header("Authorization").is_some_and(|value| value.starts_with("Basic ")));
        assert!(requests[0].body_text().contains(ACTION_CREATE));
    }

    #[test]
    fn test_negotiate_header() {
        assert_eq!(negotiate_header(b"NTLMSSP\0"), "Negotiate TlRMTVNTUAA=");
    }
}
