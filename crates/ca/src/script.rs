//! PowerShell scripts driving the CA through its COM interfaces.
//!
//! Every value that reaches a script is validated first and then rendered as
//! a single-quoted PowerShell literal, so a CA name, template or serial can
//! never expand variables or start a subexpression on the CA host. Numbers
//! come from typed integers and dates from [`NaiveDate`].

use std::{collections::HashMap, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::NaiveDate;

use crate::{
    error::{CaError, Result},
    model::{AuthorityDescriptor, TemplateDescriptor, split_config_string},
    revocation::RevocationReason,
    serial::normalize_base64,
};

/// Lowest `Request.Disposition` of a certificate row (issued).
pub const DISPOSITION_MIN: u8 = 12;

/// Highest `Request.Disposition` of a certificate row (revoked).
pub const DISPOSITION_MAX: u8 = 21;

const PREAMBLE: &str = r"if ($PSVersionTable.PSVersion.Major -ge 6) {
  $OutputEncoding = [System.Text.UTF8Encoding]::new($false)
}
$PSDefaultParameterValues['Out-File:Encoding']    = 'utf8'
$PSDefaultParameterValues['Set-Content:Encoding'] = 'utf8'
$PSDefaultParameterValues['Add-Content:Encoding'] = 'utf8'
$PSDefaultParameterValues['Export-Csv:Encoding']  = 'utf8'
$ProgressPreference = 'SilentlyContinue'
Import-Module Microsoft.PowerShell.Utility -ErrorAction SilentlyContinue
$PSModuleAutoLoadingPreference = 'None'
";

const COM_TRACKING: &str = r"$script:__ComObjects = @()
function __Track-Com($obj) {
  if ($null -ne $obj -and $obj -is [__ComObject]) { $script:__ComObjects += $obj }
  return $obj
}
function __Release-AllCom() {
  foreach ($o in $script:__ComObjects) {
    try { [void][Runtime.InteropServices.Marshal]::ReleaseComObject($o) } catch {}
  }
  $script:__ComObjects = @()
}
";

const ADD_RESTRICTION: &str = r#"function Add-Restriction {
  param([__ComObject]$View, [int]$Col, [string]$Op, $Value)
  $seek = switch ($Op) {
    'eq' { 0x1 }
    'lt' { 0x2 }
    'le' { 0x4 }
    'ge' { 0x8 }
    'gt' { 0x10 }
    default { throw "Unsupported operator '$Op'." }
  }
  $View.SetRestriction($Col, $seek, 0, $Value) | Out-Null
}
"#;

const CONVERT_RAW_CERT: &str = r"function Convert-RawCertToBytes {
  param([Parameter(Mandatory)]$Val)
  if ($Val -is [byte[]]) { return $Val }
  $s = [string]$Val
  if ([string]::IsNullOrWhiteSpace($s)) { return $null }
  $s = $s -replace '-----(BEGIN|END) [^-]+-----', ''
  $s = $s -replace '\s', ''
  [Convert]::FromBase64String($s)
}
";

const VERIFY_CONNECTION_BODY: &str = "$PSVersionTable.PSVersion.ToString()\n";

const LIST_AUTHORITIES_BODY: &str = r#"  $cas = @()
  $cfg = __Track-Com (New-Object -ComObject CertificateAuthority.Config)
  [void]$cfg.Reset(0)
  $PROPTYPE_LONG  = 1
  $CR_PROP_CATYPE = 0x0000000A
  do {
    $obj = [pscustomobject]@{
      Name          = $cfg.GetField('CommonName')
      DisplayName   = $cfg.GetField('CommonName')
      ComputerName  = $cfg.GetField('Server')
      ConfigString  = $cfg.GetField('Config')
      Type          = ''
      IsEnterprise  = $false
      IsRoot        = $false
      IsAccessible  = $false
      ServiceStatus = ''
    }
    try {
      $adm = __Track-Com (New-Object -ComObject CertificateAuthority.Admin)
      $catype = $adm.GetCAProperty($obj.ConfigString, $CR_PROP_CATYPE, 0, $PROPTYPE_LONG, 0)
      switch ($catype) {
        0 { $obj.Type = 'Enterprise Root CA';        $obj.IsEnterprise = $true;  $obj.IsRoot = $true }
        1 { $obj.Type = 'Enterprise Subordinate CA'; $obj.IsEnterprise = $true;  $obj.IsRoot = $false }
        3 { $obj.Type = 'Standalone Root CA';        $obj.IsEnterprise = $false; $obj.IsRoot = $true }
        4 { $obj.Type = 'Standalone Subordinate CA'; $obj.IsEnterprise = $false; $obj.IsRoot = $false }
        default { }
      }
      $obj.IsAccessible = $true
      $obj.ServiceStatus = 'Running'
    } catch { }
    $cas += $obj
  } while ($cfg.Next() -ne -1)
  $__out = ConvertTo-Json -InputObject @($cas) -Compress -Depth 4
"#;

const LIST_TEMPLATES_BODY: &str = r#"  $root = [ADSI]'LDAP://RootDSE'
  $base = "LDAP://$($root.configurationNamingContext)"
  $ds = New-Object System.DirectoryServices.DirectorySearcher (
    (New-Object System.DirectoryServices.DirectoryEntry $base),
    '(objectClass=pKICertificateTemplate)'
  )
  $ds.PageSize    = 1000
  $ds.SearchScope = 'Subtree'
  @('cn', 'displayName', 'msPKI-Template-Schema-Version', 'revision',
    'msPKI-Template-Major-Revision', 'msPKI-Template-Minor-Revision',
    'msPKI-Cert-Template-OID') | ForEach-Object { [void]$ds.PropertiesToLoad.Add($_) }
  $results = $ds.FindAll()
  try {
    $templates = foreach ($r in $results) {
      $p = $r.Properties
      $cn     = $p['cn'] | Select-Object -First 1
      $disp   = $p['displayname'] | Select-Object -First 1
      $schema = $p['mspki-template-schema-version'] | Select-Object -First 1
      $maj    = $p['revision'] | Select-Object -First 1
      if ($null -eq $maj) { $maj = $p['mspki-template-major-revision'] | Select-Object -First 1 }
      $min    = $p['mspki-template-minor-revision'] | Select-Object -First 1
      $oid    = $p['mspki-cert-template-oid'] | Select-Object -First 1
      $minorVal = if ($null -ne $min -and $min -ne '') { [int]$min } else { 0 }
      $version  = if ($null -ne $maj -and $maj -ne '') { '{0}.{1}' -f ([int]$maj), $minorVal } else { $null }
      [pscustomobject]@{
        Name          = $cn
        DisplayName   = if ($disp) { $disp } else { $cn }
        SchemaVersion = if ($null -ne $schema -and $schema -ne '') { [string][int]$schema } else { '1' }
        Version       = $version
        OID           = $oid
      }
    }
  } finally {
    $results.Dispose()
  }
  $__out = ConvertTo-Json -InputObject @($templates | Sort-Object Name) -Compress -Depth 4
"#;

const DUMP_CERTIFICATES_BODY: &str = r"  $caName        = <<CA>>
  $Page          = <<PAGE>>
  $PageSize      = <<PAGE_SIZE>>
  $TemplateValue = <<TEMPLATE>>
  $IssuedAfter   = <<ISSUED_AFTER>>
  $skip = [Math]::Max(0, ($Page - 1) * $PageSize)
  $colsWanted = @('RequestID', 'Request.StatusCode', 'Request.DispositionMessage',
    'Request.RequesterName', 'Request.SubmittedWhen', 'Request.CommonName',
    'CertificateTemplate', 'RawCertificate')
  $view = __Track-Com (New-Object -ComObject CertificateAuthority.View)
  $view.OpenConnection($caName)
  $colIndex = @{}
  foreach ($n in ($colsWanted + 'Request.Disposition')) {
    if (-not $colIndex.ContainsKey($n)) { $colIndex[$n] = $view.GetColumnIndex(0, $n) }
  }
  try { $colIndex['NotBefore'] = $view.GetColumnIndex(0, 'NotBefore') } catch { $colIndex['NotBefore'] = $null }
  Add-Restriction -View $view -Col $colIndex['Request.Disposition'] -Op ge -Value <<DISPOSITION_MIN>>
  Add-Restriction -View $view -Col $colIndex['Request.Disposition'] -Op le -Value <<DISPOSITION_MAX>>
  if ($TemplateValue) {
    Add-Restriction -View $view -Col $colIndex['CertificateTemplate'] -Op eq -Value $TemplateValue
  }
  if ($IssuedAfter -and $null -ne $colIndex['NotBefore']) {
    $after = [datetime]::ParseExact($IssuedAfter, 'yyyy-MM-dd', [Globalization.CultureInfo]::InvariantCulture)
    Add-Restriction -View $view -Col $colIndex['NotBefore'] -Op ge -Value $after
  }
  $view.SetResultColumnCount($colsWanted.Count) | Out-Null
  foreach ($n in $colsWanted) { $view.SetResultColumn($colIndex[$n]) | Out-Null }
  $rows = __Track-Com ($view.OpenView())
  $results = New-Object 'System.Collections.Generic.List[object]'
  $i = 0
  for ($row = $rows.Next(); $row -ne -1; $row = $rows.Next()) {
    if ($i -lt $skip) { $i++; continue }
    if ($results.Count -ge $PageSize) { break }
    $cols = __Track-Com ($rows.EnumCertViewColumn())
    $vals = @{}
    foreach ($name in $colsWanted) {
      [void]$cols.Next()
      $vals[$name] = $cols.GetValue(0)
    }
    $raw = $vals['RawCertificate']
    $rawBytes = if ($null -ne $raw) { Convert-RawCertToBytes $raw } else { $null }
    $results.Add([pscustomobject]@{
      RequestID                    = $vals['RequestID']
      'Request.StatusCode'         = $vals['Request.StatusCode']
      'Request.DispositionMessage' = $vals['Request.DispositionMessage']
      'Request.RequesterName'      = $vals['Request.RequesterName']
      'Request.SubmittedWhen'      = $vals['Request.SubmittedWhen']
      'Request.CommonName'         = $vals['Request.CommonName']
      CertificateTemplate          = [string]$vals['CertificateTemplate']
      RawCertificate               = if ($rawBytes) { [Convert]::ToBase64String($rawBytes) } else { $null }
      ConfigString                 = $caName
    }) | Out-Null
    $i++
  }
  $__out = ConvertTo-Json -InputObject @($results) -Compress -Depth 4
";

const SUBMIT_REQUEST_BODY: &str = r#"  $config   = <<CA>>
  $template = <<TEMPLATE>>
  $csr      = <<REQUEST>>
  $pollMilliseconds    = <<POLL_MS>>
  $timeoutMilliseconds = <<TIMEOUT_MS>>
  $CR_OUT_BASE64 = 0x1
  $CR_OUT_NOCRLF = 0x40000000
  $encoding = $CR_OUT_BASE64 -bor $CR_OUT_NOCRLF
  $req = __Track-Com (New-Object -ComObject CertificateAuthority.Request)
  $disposition = $req.Submit(0xff, $csr, $template, $config)
  $requestId   = $req.GetRequestId()
  $certB64 = $null
  if ($disposition -eq 0 -or $disposition -eq 3) {
    $certB64 = $req.GetCertificate($encoding)
  } else {
    $elapsed = 0
    do {
      Start-Sleep -Milliseconds $pollMilliseconds
      $elapsed += $pollMilliseconds
      $disposition = $req.RetrievePending($requestId, $config)
    } until ($disposition -eq 3 -or $elapsed -ge $timeoutMilliseconds)
    if ($disposition -ne 3) { throw "Timeout waiting for certificate (request $requestId)." }
    $certB64 = $req.GetCertificate($encoding)
  }
  $__out = [pscustomobject]@{
    request_id      = $requestId
    disposition     = $disposition
    certificate_b64 = $certB64
  } | ConvertTo-Json -Compress -Depth 4
"#;

const IDENTIFY_BODY: &str = r"  $caName       = <<CA>>
  $serialNumber = <<SERIAL>>
  $colsWanted = @('SerialNumber', 'CertificateTemplate', 'Request.Disposition', 'RequestID')
  $view = __Track-Com (New-Object -ComObject CertificateAuthority.View)
  $view.OpenConnection($caName)
  $colIndex = @{}
  foreach ($n in $colsWanted) { $colIndex[$n] = $view.GetColumnIndex(0, $n) }
  Add-Restriction -View $view -Col $colIndex['SerialNumber'] -Op eq -Value $serialNumber
  Add-Restriction -View $view -Col $colIndex['Request.Disposition'] -Op ge -Value <<DISPOSITION_MIN>>
  Add-Restriction -View $view -Col $colIndex['Request.Disposition'] -Op le -Value <<DISPOSITION_MAX>>
  $view.SetResultColumnCount($colsWanted.Count) | Out-Null
  foreach ($n in $colsWanted) { $view.SetResultColumn($colIndex[$n]) | Out-Null }
  $rows = __Track-Com ($view.OpenView())
  $results = New-Object 'System.Collections.Generic.List[object]'
  for ($row = $rows.Next(); $row -ne -1; $row = $rows.Next()) {
    $cols = __Track-Com ($rows.EnumCertViewColumn())
    $vals = @{}
    foreach ($name in $colsWanted) {
      [void]$cols.Next()
      $vals[$name] = $cols.GetValue(0)
    }
    $results.Add([pscustomobject]@{
      SerialNumber          = $vals['SerialNumber']
      CertificateTemplate   = [string]$vals['CertificateTemplate']
      'Request.Disposition' = $vals['Request.Disposition']
      RequestID             = $vals['RequestID']
      ConfigString          = $caName
    }) | Out-Null
  }
  $__out = ConvertTo-Json -InputObject @($results) -Compress -Depth 4
";

const REVOKE_BODY: &str = r#"  $caConfig   = <<CA>>
  $serialIn   = <<SERIAL>>
  $reasonCode = <<REASON>>
  $admin = __Track-Com (New-Object -ComObject CertificateAuthority.Admin)
  $when = if ($reasonCode -eq 8) { 0 } else { Get-Date }
  try {
    $admin.RevokeCertificate($caConfig, $serialIn, $reasonCode, $when)
  } catch {
    throw "Revocation failed: $($_.Exception.Message)"
  }
  $__out = 'revoked'
"#;

/// Renders a value as a single-quoted PowerShell literal.
///
/// PowerShell treats the typographic single quotes U+2018 to U+201B as
/// quote characters too, so they are doubled along with `'`.
#[must_use]
pub fn ps_literal(value: &str) -> String {
    let mut literal = String::with_capacity(value.len() + 2);
    literal.push('\'');
    for c in value.chars() {
        if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            literal.push(c);
        }
        literal.push(c);
    }
    literal.push('\'');
    literal
}

/// Renders the CA scripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEncoder;

impl ScriptEncoder {
    /// Creates an encoder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Script printing the remote PowerShell version.
    #[must_use]
    pub fn verify_connection(&self) -> String {
        format!("{PREAMBLE}{VERIFY_CONNECTION_BODY}")
    }

    /// Script listing every CA visible from the host as a JSON array.
    #[must_use]
    pub fn list_authorities(&self) -> String {
        com_script(&[], LIST_AUTHORITIES_BODY)
    }

    /// Script listing the certificate templates published in Active
    /// Directory as a JSON array.
    #[must_use]
    pub fn list_templates(&self) -> String {
        com_script(&[], LIST_TEMPLATES_BODY)
    }

    /// Script returning one page (1-based) of certificates held by `ca`.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Validation`] for a malformed config string,
    /// template name or template OID, or a zero page or page size.
    pub fn dump_certificates(
        &self,
        ca: &AuthorityDescriptor,
        template: Option<&TemplateDescriptor>,
        issued_after: Option<NaiveDate>,
        page: u32,
        page_size: u32,
    ) -> Result<String> {
        if page == 0 || page_size == 0 {
            return Err(CaError::validation("Page and page size start at 1"));
        }
        let template_value = match template {
            Some(template) if template.is_legacy() => checked_template_name(&template.name)?,
            Some(template) => checked_oid(&template.oid)?,
            None => "",
        };
        let issued_after = issued_after.map(|date| date.format("%Y-%m-%d").to_string()).unwrap_or_default();
        let body = render(
            DUMP_CERTIFICATES_BODY,
            &[
                ("CA", ps_literal(checked_config_string(&ca.config_string)?)),
                ("PAGE", page.to_string()),
                ("PAGE_SIZE", page_size.to_string()),
                ("TEMPLATE", ps_literal(template_value)),
                ("ISSUED_AFTER", ps_literal(&issued_after)),
                ("DISPOSITION_MIN", DISPOSITION_MIN.to_string()),
                ("DISPOSITION_MAX", DISPOSITION_MAX.to_string()),
            ],
        );
        Ok(com_script(&[ADD_RESTRICTION, CONVERT_RAW_CERT], &body))
    }

    /// Script submitting a base64 request and waiting for the certificate.
    ///
    /// A pending request is polled every `polling_interval` until it is
    /// issued or `timeout` has elapsed, after which the script throws.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Validation`] for a malformed request, config string
    /// or template name.
    pub fn submit_request(
        &self,
        request: &str,
        ca: &AuthorityDescriptor,
        template: &TemplateDescriptor,
        polling_interval: Duration,
        timeout: Duration,
    ) -> Result<String> {
        let request = checked_base64(request)?;
        let template_attribute = format!("CertificateTemplate:{}", checked_template_name(&template.name)?);
        let body = render(
            SUBMIT_REQUEST_BODY,
            &[
                ("CA", ps_literal(checked_config_string(&ca.config_string)?)),
                ("TEMPLATE", ps_literal(&template_attribute)),
                ("REQUEST", ps_literal(&request)),
                ("POLL_MS", polling_interval.as_millis().max(1).to_string()),
                ("TIMEOUT_MS", timeout.as_millis().to_string()),
            ],
        );
        Ok(com_script(&[], &body))
    }

    /// Script looking up issued or revoked certificates by serial number.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Validation`] for a non-hex serial or a malformed
    /// config string.
    pub fn identify_certificate(&self, serial: &str, ca: &AuthorityDescriptor) -> Result<String> {
        let body = render(
            IDENTIFY_BODY,
            &[
                ("CA", ps_literal(checked_config_string(&ca.config_string)?)),
                ("SERIAL", ps_literal(checked_serial(serial)?)),
                ("DISPOSITION_MIN", DISPOSITION_MIN.to_string()),
                ("DISPOSITION_MAX", DISPOSITION_MAX.to_string()),
            ],
        );
        Ok(com_script(&[ADD_RESTRICTION], &body))
    }

    /// Script revoking a certificate through `ICertAdmin::RevokeCertificate`.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Validation`] for a non-hex serial or a malformed
    /// config string.
    pub fn revoke(&self, ca: &AuthorityDescriptor, serial: &str, reason: RevocationReason) -> Result<String> {
        let body = render(
            REVOKE_BODY,
            &[
                ("CA", ps_literal(checked_config_string(&ca.config_string)?)),
                ("SERIAL", ps_literal(checked_serial(serial)?)),
                ("REASON", reason.code().to_string()),
            ],
        );
        Ok(com_script(&[], &body))
    }
}

fn com_script(helpers: &[&str], body: &str) -> String {
    let mut script = String::with_capacity(PREAMBLE.len() + COM_TRACKING.len() + body.len() + 128);
    script.push_str(PREAMBLE);
    script.push_str(COM_TRACKING);
    for helper in helpers {
        script.push_str(helper);
    }
    script.push_str("$__out = $null\ntry {\n");
    script.push_str(body);
    script.push_str("} finally {\n  __Release-AllCom\n}\n$__out\n");
    script
}

/// Substitutes `<<NAME>>` placeholders in one pass, so substituted values
/// are never scanned again.
fn render(template: &str, values: &[(&str, String)]) -> String {
    let values: HashMap<&str, &str> = values.iter().map(|(name, value)| (*name, value.as_str())).collect();
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;
    while let Some(start) = rest.find("<<") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find(">>").and_then(|end| values.get(&after[..end]).map(|value| (end, value))) {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 2..];
            },
            None => {
                out.push_str("<<");
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}

fn checked_config_string(config_string: &str) -> Result<&str> {
    split_config_string(config_string)?;
    Ok(config_string)
}

fn checked_serial(serial: &str) -> Result<&str> {
    let serial = serial.trim();
    if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CaError::validation(format!("Serial number '{serial}' is not hexadecimal")));
    }
    Ok(serial)
}

fn checked_oid(oid: &str) -> Result<&str> {
    let oid = oid.trim();
    let mut arcs = oid.split('.');
    let well_formed = arcs.clone().count() >= 2
        && arcs.all(|arc| !arc.is_empty() && arc.chars().all(|c| c.is_ascii_digit()));
    if !well_formed {
        return Err(CaError::validation(format!("Template OID '{oid}' is not a dotted-decimal OID")));
    }
    Ok(oid)
}

fn checked_template_name(name: &str) -> Result<&str> {
    if name.trim().is_empty() || name.chars().any(char::is_control) {
        return Err(CaError::validation(format!("Template name {name:?} is not valid")));
    }
    Ok(name)
}

fn checked_base64(request: &str) -> Result<String> {
    let request = normalize_base64(request);
    if request.is_empty() || STANDARD.decode(&request).is_err() {
        return Err(CaError::validation("Certificate request is not valid base64"));
    }
    Ok(request)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn ca() -> AuthorityDescriptor {
        AuthorityDescriptor::from_config_string(r"ca01.corp.local\Corp Issuing CA").unwrap()
    }

    fn assert_wrapped(script: &str) {
        assert!(script.starts_with(PREAMBLE));
        assert!(script.contains("} finally {\n  __Release-AllCom\n}\n$__out\n"));
        assert!(!script.contains("<<"), "unrendered placeholder in:\n{script}");
    }

    #[test]
    fn test_ps_literal_doubles_quotes() {
        assert_eq!(ps_literal("plain"), "'plain'");
        assert_eq!(ps_literal("O'Brien"), "'O''Brien'");
        assert_eq!(ps_literal("a\u{2019}b"), "'a\u{2019}\u{2019}b'");
        assert_eq!(ps_literal("$(Remove-Item C:\\)"), "'$(Remove-Item C:\\)'");
        assert_eq!(ps_literal(""), "''");
    }

    #[test]
    fn test_render_is_single_pass() {
        let out = render("a=<<A>> b=<<B>> c=<<C>>", &[("A", "<<B>>".into()), ("B", "2".into())]);
        assert_eq!(out, "a=<<B>> b=2 c=<<C>>");
    }

    #[test]
    fn test_config_string_is_quoted() {
        let ca = AuthorityDescriptor::from_config_string(r"ca01\Bob's CA").unwrap();
        let script = ScriptEncoder::new().identify_certificate("0a1b", &ca).unwrap();
        assert!(script.contains(r"$caName       = 'ca01\Bob''s CA'"));
        assert!(script.contains("$serialNumber = '0a1b'"));
        assert_wrapped(&script);
    }

    #[test]
    fn test_injection_attempts_rejected() {
        let encoder = ScriptEncoder::new();
        let err = encoder.identify_certificate("0a1b'; Remove-Item x; '", &ca()).unwrap_err();
        assert!(matches!(err, CaError::Validation { .. }));

        let bad_ca = AuthorityDescriptor { config_string: "ca01\\CA\nRemove-Item".into(), ..ca() };
        assert!(encoder.revoke(&bad_ca, "0a1b", RevocationReason::Superseded).is_err());

        let bad_oid = TemplateDescriptor::new("T", "T", "2", "1.0", "1.2.3; evil");
        assert!(encoder.dump_certificates(&ca(), Some(&bad_oid), None, 1, 10).is_err());

        let template = TemplateDescriptor::new("WebServer", "Web", "1", "4.1", "1.2.3");
        let err = encoder
            .submit_request("MIIB'+$(evil)+'", &ca(), &template, Duration::from_millis(100), Duration::from_secs(3))
            .unwrap_err();
        assert!(matches!(err, CaError::Validation { .. }));
    }

    #[test]
    fn test_dump_uses_name_for_legacy_templates() {
        let legacy = TemplateDescriptor::new("WebServer", "Web Server", "1", "4.1", "1.3.6.1.4.1.311.21.8.1");
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let script = ScriptEncoder::new().dump_certificates(&ca(), Some(&legacy), Some(date), 3, 500).unwrap();
        assert!(script.contains("$TemplateValue = 'WebServer'"));
        assert!(script.contains("$IssuedAfter   = '2024-03-09'"));
        assert!(script.contains("$Page          = 3"));
        assert!(script.contains("$PageSize      = 500"));
        assert!(script.contains("-Op ge -Value 12"));
        assert!(script.contains("-Op le -Value 21"));
        assert!(script.contains("function Convert-RawCertToBytes"));
        assert_wrapped(&script);
    }

    #[test]
    fn test_dump_uses_oid_for_v2_templates() {
        let v2 = TemplateDescriptor::new("CorpWeb", "Corp Web", "2", "100.4", "1.3.6.1.4.1.311.21.8.2");
        let script = ScriptEncoder::new().dump_certificates(&ca(), Some(&v2), None, 1, 1000).unwrap();
        assert!(script.contains("$TemplateValue = '1.3.6.1.4.1.311.21.8.2'"));
        assert!(script.contains("$IssuedAfter   = ''"));

        let any = ScriptEncoder::new().dump_certificates(&ca(), None, None, 1, 1000).unwrap();
        assert!(any.contains("$TemplateValue = ''"));
    }

    #[test]
    fn test_dump_rejects_zero_page() {
        assert!(ScriptEncoder::new().dump_certificates(&ca(), None, None, 0, 10).is_err());
        assert!(ScriptEncoder::new().dump_certificates(&ca(), None, None, 1, 0).is_err());
    }

    #[test]
    fn test_submit_request_rendering() {
        let template = TemplateDescriptor::new("WebServer", "Web", "1", "4.1", "1.2.3");
        let pem = "-----BEGIN NEW CERTIFICATE REQUEST-----\nTUlJ\nQg==\n-----END NEW CERTIFICATE REQUEST-----";
        let script = ScriptEncoder::new()
            .submit_request(pem, &ca(), &template, Duration::from_millis(250), Duration::from_secs(5))
            .unwrap();
        assert!(script.contains("$csr      = 'TUlJQg=='"));
        assert!(script.contains("$template = 'CertificateTemplate:WebServer'"));
        assert!(script.contains("$pollMilliseconds    = 250"));
        assert!(script.contains("$timeoutMilliseconds = 5000"));
        assert_wrapped(&script);
    }

    #[test]
    fn test_revoke_renders_reason_code() {
        let script = ScriptEncoder::new().revoke(&ca(), "8f3a00c4", RevocationReason::RemoveFromCrl).unwrap();
        assert!(script.contains("$reasonCode = 8"));
        assert!(script.contains("$serialIn   = '8f3a00c4'"));
        assert_wrapped(&script);
    }

    #[test]
    fn test_listing_scripts_wrapped() {
        let encoder = ScriptEncoder::new();
        assert_wrapped(&encoder.list_authorities());
        assert_wrapped(&encoder.list_templates());
        assert!(encoder.verify_connection().starts_with(PREAMBLE));
    }

    #[test]
    fn test_oid_validation() {
        assert!(checked_oid("1.3.6.1.4.1.311.21.8.2").is_ok());
        for bad in ["", "1", "1..2", "1.2.", "1.a.3"] {
            assert!(checked_oid(bad).is_err(), "{bad:?} accepted");
        }
    }

    mod proptests {
        use proptest::prelude::*;

        use crate::script::{checked_serial, ps_literal};

        fn unquote(literal: &str) -> Option<String> {
            let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
            let mut out = String::new();
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') && chars.next() != Some(c) {
                    return None;
                }
                out.push(c);
            }
            Some(out)
        }

        proptest! {
            /// A rendered literal always closes where it should and reads
            /// back as the original value.
            #[test]
            fn literal_round_trips(value in "\\PC*") {
                prop_assert_eq!(unquote(&ps_literal(&value)), Some(value));
            }

            /// Hex serials are accepted as they are.
            #[test]
            fn hex_serials_accepted(serial in "[0-9a-fA-F]{1,40}") {
                prop_assert_eq!(checked_serial(&serial).ok(), Some(serial.as_str()));
            }
        }
    }
}
