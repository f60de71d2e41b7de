//! Runspace transport: a persistent PowerShell host driven over stdin/stdout.
//!
//! `connect` starts one long-lived `powershell` process inside a cmd shell and
//! feeds it the host loop below over a piped (non-console) stdin. Each script
//! is gzipped, base64 encoded and sent as a `<id> <length>` header line
//! followed by the payload in lines of at most 4000 characters. It runs
//! dot-sourced in the host's scope, so variables and imported modules persist
//! across invocations. The host answers with a frame:
//!
//! ```text
//! <rendered output lines...>
//! <<<ERRORS:<id>>>
//! [{"Message": ..., "FullyQualifiedErrorId": ..., "CategoryInfo": ..., "ScriptStackTrace": ...}]
//! <<<END:<id>>>
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::{
    config::TransportConfig,
    credentials::RemoteTarget,
    encoding::{encode_command, gzip_base64},
    error::{RemotingError, Result},
    result::RemoteResult,
    session::RemoteSession,
    wsman::WsManClient,
};

const HOST_SCRIPT: &str = r#"$ProgressPreference = 'SilentlyContinue'
$ErrorActionPreference = 'Continue'
[Console]::OutputEncoding = [Text.Encoding]::UTF8
$__stdin = [Console]::In
$__stdout = [Console]::Out
while ($true) {
    $__header = $__stdin.ReadLine()
    if ($null -eq $__header) { break }
    $__parts = $__header.Split(' ')
    if ($__parts.Count -ne 2) { continue }
    $__id = $__parts[0]
    $__total = [int]$__parts[1]
    $__payload = New-Object Text.StringBuilder($__total)
    while ($__payload.Length -lt $__total) {
        $__chunk = $__stdin.ReadLine()
        if ($null -eq $__chunk) { break }
        [void]$__payload.Append($__chunk)
    }
    if ($__payload.Length -ne $__total) { break }
    $__ms = New-Object IO.MemoryStream(,[Convert]::FromBase64String($__payload.ToString()))
    $__gs = New-Object IO.Compression.GzipStream($__ms, [IO.Compression.CompressionMode]::Decompress)
    $__sr = New-Object IO.StreamReader($__gs, [Text.Encoding]::UTF8)
    $__code = $__sr.ReadToEnd(); $__sr.Close(); $__gs.Close(); $__ms.Close()
    $__records = New-Object System.Collections.ArrayList
    try {
        . ([ScriptBlock]::Create($__code)) 2>&1 | ForEach-Object {
            if ($_ -is [System.Management.Automation.ErrorRecord]) { [void]$__records.Add($_) }
            else { $_ | Out-String -Stream -Width 4096 | ForEach-Object { $__stdout.WriteLine($_) } }
        }
    } catch { [void]$__records.Add($_) }
    $__errors = @($__records | ForEach-Object {
        [pscustomobject]@{
            Message = $_.Exception.Message
            FullyQualifiedErrorId = $_.FullyQualifiedErrorId
            CategoryInfo = $_.CategoryInfo.ToString()
            ScriptStackTrace = $_.ScriptStackTrace
        }
    })
    $__stdout.WriteLine("<<<ERRORS:$__id>>>")
    $__stdout.WriteLine((ConvertTo-Json -InputObject $__errors -Compress -Depth 3))
    $__stdout.WriteLine("<<<END:$__id>>>")
    $__stdout.Flush()
}
"#;

/// Longest payload line written to the host's stdin.
const INPUT_LINE_LIMIT: usize = 4000;

/// One error record emitted by the remote host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ErrorRecord {
    /// Exception message.
    pub message: Option<String>,
    /// Fully qualified error id.
    pub fully_qualified_error_id: Option<String>,
    /// Category summary.
    pub category_info: Option<String>,
    /// Script stack trace.
    pub script_stack_trace: Option<String>,
}

#[derive(Debug)]
struct Host {
    client: WsManClient,
    shell_id: String,
    command_id: String,
}

/// Session keeping one PowerShell host alive for its whole lifetime.
#[derive(Debug)]
pub struct RunspaceSession {
    target: RemoteTarget,
    transport: TransportConfig,
    host: Option<Host>,
    next_invocation: u64,
    buffer: String,
    broken: bool,
}

impl RunspaceSession {
    /// Creates an unconnected session.
    #[must_use]
    pub fn new(target: RemoteTarget, transport: TransportConfig) -> Self {
        Self { target, transport, host: None, next_invocation: 0, buffer: String::new(), broken: false }
    }

    async fn invoke(&mut self, script: &str) -> Result<(String, Vec<ErrorRecord>)> {
        let Some(host) = &self.host else {
            return Err(RemotingError::connection(format!("runspace on {} is not open", self.target.host)));
        };

        self.next_invocation += 1;
        let id = self.next_invocation;
        let frame = input_frame(id, script)?;
        host.client.send_stream(&host.shell_id, &host.command_id, &frame).await?;

        let end_marker = format!("<<<END:{id}>>>");
        loop {
            if let Some(frame) = take_frame(&mut self.buffer, id, &end_marker) {
                return frame;
            }
            let chunk = host.client.receive(&host.shell_id, &host.command_id).await?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk.stdout));
            if !chunk.stderr.is_empty() {
                tracing::debug!(stderr = %String::from_utf8_lossy(&chunk.stderr), "PowerShell host stderr");
            }
            if chunk.done && !self.buffer.contains(&end_marker) {
                return Err(RemotingError::transport_failure(format!(
                    "PowerShell host exited with status {}",
                    chunk.exit_code.unwrap_or_default()
                )));
            }
        }
    }
}

/// Stdin bytes carrying `script` as invocation `id`.
fn input_frame(id: u64, script: &str) -> Result<Vec<u8>> {
    let payload = gzip_base64(script)
        .map_err(|e| RemotingError::transport_failure_with_source("failed to compress script", e))?;
    let mut frame = format!("{id} {}\n", payload.len()).into_bytes();
    for line in payload.as_bytes().chunks(INPUT_LINE_LIMIT) {
        frame.extend_from_slice(line);
        frame.push(b'\n');
    }
    Ok(frame)
}

/// Removes the frame for invocation `id` from `buffer` once its end marker arrived.
fn take_frame(buffer: &mut String, id: u64, end_marker: &str) -> Option<Result<(String, Vec<ErrorRecord>)>> {
    let end = buffer.find(end_marker)?;
    let frame: String = buffer[..end].to_owned();
    let rest_start = buffer[end..].find('\n').map_or(buffer.len(), |n| end + n + 1);
    buffer.replace_range(..rest_start, "");

    let errors_marker = format!("<<<ERRORS:{id}>>>");
    let Some(split) = frame.find(&errors_marker) else {
        return Some(Err(RemotingError::transport_failure("malformed runspace frame: missing error section")));
    };
    let output = frame[..split].replace("\r\n", "\n").trim_end_matches('\n').to_owned();
    let errors_json = frame[split + errors_marker.len()..].trim();
    Some(parse_error_records(errors_json).map(|records| (output, records)))
}

fn parse_error_records(json: &str) -> Result<Vec<ErrorRecord>> {
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| RemotingError::transport_failure_with_source("malformed runspace error records", e))?;
    let records = match value {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::Array(_) => serde_json::from_value(value)
            .map_err(|e| RemotingError::transport_failure_with_source("malformed runspace error records", e))?,
        single => vec![
            serde_json::from_value(single)
                .map_err(|e| RemotingError::transport_failure_with_source("malformed runspace error records", e))?,
        ],
    };
    Ok(records)
}

#[async_trait]
impl RemoteSession for RunspaceSession {
    async fn connect(&mut self) -> Result<()> {
        let client = WsManClient::new(&self.target, &self.transport)?;
        let endpoint = client.endpoint().to_owned();
        let wrap = |e: RemotingError| match e {
            RemotingError::Connection { .. } => e,
            other => RemotingError::connection_with_source(format!("failed to start runspace on {endpoint}"), other),
        };

        let shell_id = client.create_shell().await.map_err(wrap)?;
        let command = format!(
            "powershell -NoLogo -NoProfile -NonInteractive -encodedcommand {}",
            encode_command(HOST_SCRIPT)
        );
        let command_id = match client.command(&shell_id, &command, &[], false).await {
            Ok(id) => id,
            Err(err) => {
                if let Err(cleanup) = client.delete_shell(&shell_id).await {
                    tracing::debug!(shell_id = %shell_id, error = %cleanup, "Failed to delete shell after host start failure");
                }
                return Err(wrap(err));
            },
        };

        tracing::debug!(host = %self.target.host, shell_id = %shell_id, "Opened runspace host");
        self.host = Some(Host { client, shell_id, command_id });
        self.buffer.clear();
        self.broken = false;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(host) = self.host.take() else {
            return Ok(());
        };
        if !self.broken
            && let Err(err) = host.client.send_input(&host.shell_id, &host.command_id, b"", true).await
        {
            tracing::debug!(shell_id = %host.shell_id, error = %err, "Failed to close runspace stdin");
        }
        host.client.signal_terminate(&host.shell_id, &host.command_id).await;
        host.client.delete_shell(&host.shell_id).await?;
        tracing::debug!(host = %self.target.host, "Closed runspace host");
        Ok(())
    }

    #[tracing::instrument(skip(self, script), fields(host = %self.target.host, script_len = script.len()))]
    async fn run_script(&mut self, script: &str) -> Result<RemoteResult> {
        if self.broken {
            return Err(RemotingError::transport_failure("runspace transport is broken"));
        }
        tracing::trace!(script, "Running PowerShell script");

        let (output, records) = match self.invoke(script).await {
            Ok(frame) => frame,
            Err(err @ RemotingError::Connection { .. }) => return Err(err),
            Err(err) => {
                self.broken = true;
                tracing::warn!(host = %self.target.host, error = %err, "Runspace transport failure");
                return Err(match err {
                    RemotingError::TransportFailure { .. } => err,
                    other => RemotingError::transport_failure_with_source("runspace invocation failed", other),
                });
            },
        };

        if records.is_empty() {
            return Ok(RemoteResult::success(output));
        }

        for record in &records {
            tracing::error!(
                error_message = record.message.as_deref().unwrap_or_default(),
                error_id = record.fully_qualified_error_id.as_deref().unwrap_or_default(),
                category = record.category_info.as_deref().unwrap_or_default(),
                stack = record.script_stack_trace.as_deref().unwrap_or_default(),
                "PowerShell error record",
            );
        }
        let std_err = records
            .iter()
            .map(|r| r.message.as_deref().unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(RemoteResult::with_errors(Bytes::from(output), Bytes::from(std_err)))
    }

    fn is_usable(&self) -> bool {
        !self.broken
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_waits_for_end_marker() {
        let mut buffer = "line one\r\n<<<ERRORS:1>>>\r\n".to_owned();
        assert!(take_frame(&mut buffer, 1, "<<<END:1>>>").is_none());
        assert_eq!(buffer, "line one\r\n<<<ERRORS:1>>>\r\n");
    }

    #[test]
    fn test_frame_without_errors() {
        let mut buffer = "line one\r\nline two\r\n<<<ERRORS:7>>>\r\n[]\r\n<<<END:7>>>\r\n".to_owned();
        let (output, records) = take_frame(&mut buffer, 7, "<<<END:7>>>").unwrap().unwrap();
        assert_eq!(output, "line one\nline two");
        assert!(records.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frame_with_error_records() {
        let mut buffer = concat!(
            "<<<ERRORS:2>>>\n",
            r#"[{"Message":"Access is denied","FullyQualifiedErrorId":"UnauthorizedAccess","CategoryInfo":"PermissionDenied","ScriptStackTrace":"at <ScriptBlock>"},{"Message":"second"}]"#,
            "\n<<<END:2>>>\nleftover"
        )
        .to_owned();
        let (output, records) = take_frame(&mut buffer, 2, "<<<END:2>>>").unwrap().unwrap();
        assert!(output.is_empty());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message.as_deref(), Some("Access is denied"));
        assert_eq!(records[0].fully_qualified_error_id.as_deref(), Some("UnauthorizedAccess"));
        assert_eq!(records[1].category_info, None);
        assert_eq!(buffer, "leftover");
    }

    #[test]
    fn test_single_record_object_accepted() {
        let records = parse_error_records(r#"{"Message":"only"}"#).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_malformed_frame_is_transport_failure() {
        let mut buffer = "garbage\n<<<END:3>>>\n".to_owned();
        let err = take_frame(&mut buffer, 3, "<<<END:3>>>").unwrap().unwrap_err();
        assert_eq!(err.status_code(), Some(-1));
    }

    #[test]
    fn test_large_script_input_frame() {
        use std::io::Read;

        use base64::{Engine, engine::general_purpose::STANDARD};
        use flate2::read::GzDecoder;

        let script: String = (0..1500u64)
            .map(|i| format!("$v{i} = '{:016x}'\n", i.wrapping_mul(0x9e37_79b9_7f4a_7c15)))
            .collect();
        assert!(script.len() >= 16 * 1024);

        let frame = String::from_utf8(input_frame(9, &script).unwrap()).unwrap();
        let mut lines = frame.lines();
        let header = lines.next().unwrap();
        let payload_lines: Vec<&str> = lines.collect();
        assert!(payload_lines.len() > 1);
        assert!(payload_lines.iter().all(|line| !line.is_empty() && line.len() <= INPUT_LINE_LIMIT));

        let payload = payload_lines.concat();
        assert_eq!(header, format!("9 {}", payload.len()));

        let mut decoded = String::new();
        GzDecoder::new(STANDARD.decode(payload).unwrap().as_slice()).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, script);
    }

    #[test]
    fn test_small_script_is_one_payload_line() {
        let frame = input_frame(1, "Get-Date").unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_failed_host_start_deletes_shell_and_logs_cleanup_error() {
        use crate::loopback::{CapturedLogs, LoopbackResponse, LoopbackServer};

        let logs = CapturedLogs::start();
        let server = LoopbackServer::replay(vec![
            LoopbackResponse::soap(200, "<s:Body><rsp:Shell><rsp:ShellId>SHELL-3</rsp:ShellId></rsp:Shell></s:Body>"),
            LoopbackResponse::soap(500, "<s:Fault><s:Reason><s:Text>command refused</s:Text></s:Reason></s:Fault>"),
            LoopbackResponse::soap(500, "<s:Fault><s:Reason><s:Text>delete refused</s:Text></s:Reason></s:Fault>"),
        ])
        .await;
        let creds = crate::credentials::Credentials::new("svc", "pw", crate::credentials::AuthScheme::Basic);
        let mut session =
            RunspaceSession::new(RemoteTarget::new("127.0.0.1", server.port, false, creds), TransportConfig::default());

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, RemotingError::Connection { .. }));
        assert!(format!("{err:?}").contains("command refused"));

        let requests = server.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].body_text().contains(r#"Name="WINRS_CONSOLEMODE_STDIN">FALSE"#));
        assert!(requests[2].body_text().contains("transfer/Delete"));

        let logs = logs.text();
        assert!(logs.contains("Failed to delete shell after host start failure"));
        assert!(logs.contains("delete refused"));
    }

    #[tokio::test]
    async fn test_run_before_connect_fails() {
        let creds = crate::credentials::Credentials::new("svc", "pw", crate::credentials::AuthScheme::Basic);
        let target = RemoteTarget::new("127.0.0.1", 1, false, creds);
        let mut session = RunspaceSession::new(target, TransportConfig::default());
        let err = session.run_script("$null=1").await.unwrap_err();
        assert!(matches!(err, RemotingError::Connection { .. }));
        assert!(session.is_usable());
    }
}
