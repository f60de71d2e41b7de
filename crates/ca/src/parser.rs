//! Conversion of script output into typed records.
//!
//! The scripts print one compressed JSON array or object. Hosts sometimes
//! write warnings around it, so when strict parsing fails the first value
//! is read from the first line that opens one and anything after it is
//! ignored. Output that does not look like JSON at all is read as
//! `Format-List` text:
//!
//! ```text
//! Name          : Corp Issuing CA
//! ConfigString  : ca01\Corp Issuing CA
//! RawCertificate: MIIFzTCCA7WgAwIBAgITHAAAAAq
//!                 8DxA3ZTCwAAAAAAAKMA0GCSqGSIb3
//! ```
//!
//! Records end at a blank line or when a field repeats; indented lines
//! continue the previous value with their whitespace removed. Both shapes
//! end up as the same field maps, and field names match regardless of case,
//! `_` and `.`, so `display_name`, `DisplayName` and `displayname` are one
//! field.
//!
//! Unparsable output yields no records. Callers that must tell "nothing
//! found" from "several found" count the records themselves.

use serde_json::{Map, Value};

use crate::model::{
    AuthorityDescriptor, CaRecord, CertificateRecord, IdentifiedCertificate, SubmissionRecord, TemplateDescriptor,
};

type Record = Map<String, Value>;

/// Parses script output into typed records.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultParser;

impl ResultParser {
    /// Certificates printed by the dump script. Rows without a certificate
    /// body are skipped.
    #[must_use]
    pub fn parse_certificates(stdout: &str) -> Vec<CertificateRecord> {
        records(stdout)
            .iter()
            .filter_map(|record| {
                let certificate_b64 = text(record, &["rawcertificate", "certificateb64"]).filter(|c| !c.is_empty())?;
                Some(CertificateRecord {
                    template: text(record, &["certificatetemplate", "template"]).unwrap_or_default(),
                    certificate_b64,
                })
            })
            .collect()
    }

    /// Rows printed by the identify script.
    #[must_use]
    pub fn parse_identified(stdout: &str) -> Vec<IdentifiedCertificate> {
        records(stdout)
            .iter()
            .map(|record| IdentifiedCertificate {
                certificate_template: text(record, &["certificatetemplate"]).unwrap_or_default(),
                serial_number: text(record, &["serialnumber"]).unwrap_or_default(),
                config_string: text(record, &["configstring"]).unwrap_or_default(),
            })
            .collect()
    }

    /// Templates printed by the template listing. Entries without a name are
    /// skipped; a missing schema version is treated as legacy.
    #[must_use]
    pub fn parse_templates(stdout: &str) -> Vec<TemplateDescriptor> {
        records(stdout)
            .iter()
            .filter_map(|record| {
                let name = text(record, &["name", "cn"]).filter(|n| !n.is_empty())?;
                Some(TemplateDescriptor {
                    display_name: text(record, &["displayname"]).filter(|d| !d.is_empty()).unwrap_or_else(|| name.clone()),
                    schema_version: text(record, &["schemaversion"])
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| adcs_connector_cmc::LEGACY_SCHEMA_VERSION.to_owned()),
                    version: text(record, &["version"]).filter(|v| !v.is_empty()),
                    oid: text(record, &["oid", "templateoid"]).unwrap_or_default(),
                    name,
                })
            })
            .collect()
    }

    /// CAs printed by the authority listing. Entries without a config string
    /// are skipped.
    #[must_use]
    pub fn parse_authorities(stdout: &str) -> Vec<CaRecord> {
        records(stdout)
            .iter()
            .filter_map(|record| {
                let config_string = text(record, &["configstring"]).filter(|c| !c.is_empty())?;
                let name = text(record, &["name", "commonname"]).unwrap_or_default();
                Some(AuthorityDescriptor {
                    display_name: text(record, &["displayname"]).unwrap_or_else(|| name.clone()),
                    computer_name: text(record, &["computername", "server"]).unwrap_or_default(),
                    ca_type: text(record, &["type", "catype"]).unwrap_or_default(),
                    is_enterprise: boolean(record, &["isenterprise"]),
                    is_root: boolean(record, &["isroot"]),
                    is_accessible: boolean(record, &["isaccessible"]),
                    service_status: text(record, &["servicestatus"]).unwrap_or_default(),
                    name,
                    config_string,
                })
            })
            .collect()
    }

    /// The object printed by the submit script, if any.
    #[must_use]
    pub fn parse_submission(stdout: &str) -> Option<SubmissionRecord> {
        let records = records(stdout);
        let record = records.first()?;
        Some(SubmissionRecord {
            request_id: integer(record, &["requestid"]),
            disposition: integer(record, &["disposition"]),
            certificate_b64: text(record, &["certificateb64", "certificate"]).filter(|c| !c.is_empty()),
        })
    }
}

fn records(stdout: &str) -> Vec<Record> {
    let trimmed = stdout.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return from_value(value);
    }
    if let Some(start) = json_start(trimmed) {
        let mut stream = serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        return match stream.next() {
            Some(Ok(value)) => from_value(value),
            _ => {
                tracing::debug!(offset = start, "discarding malformed JSON output");
                Vec::new()
            },
        };
    }
    legacy_records(trimmed)
}

/// Byte offset of the first line that opens a JSON array or object.
fn json_start(text: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let indent = line.len() - line.trim_start().len();
        if line.trim_start().starts_with(['{', '[']) {
            return Some(offset + indent);
        }
        offset += line.len();
    }
    None
}

fn from_value(value: Value) -> Vec<Record> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(record) => Some(record),
                _ => None,
            })
            .collect(),
        Value::Object(record) => vec![record],
        _ => Vec::new(),
    }
}

fn legacy_records(text: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut current = Record::new();
    let mut last_key: Option<String> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            last_key = None;
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            if let Some(key) = &last_key
                && let Some(Value::String(value)) = current.get_mut(key)
            {
                value.extend(line.chars().filter(|c| !c.is_whitespace()));
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_owned();
        if key.is_empty() {
            continue;
        }
        if current.contains_key(&key) {
            records.push(std::mem::take(&mut current));
        }
        current.insert(key.clone(), Value::String(value.trim().to_owned()));
        last_key = Some(key);
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

fn normalize(key: &str) -> String {
    key.chars().filter(|c| !matches!(c, '_' | '.' | ' ')).flat_map(char::to_lowercase).collect()
}

fn field<'a>(record: &'a Record, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| record.iter().find(|(key, _)| normalize(key) == *name).map(|(_, value)| value))
}

fn text(record: &Record, names: &[&str]) -> Option<String> {
    match field(record, names)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn integer(record: &Record, names: &[&str]) -> Option<i64> {
    match field(record, names)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn boolean(record: &Record, names: &[&str]) -> bool {
    match field(record, names) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_json_certificates_preserved() {
        let stdout = r#"[{"RequestID":7,"CertificateTemplate":"WebServer","RawCertificate":"MIIBAA=="},
                         {"RequestID":8,"CertificateTemplate":"1.3.6.1.4.1.311.21.8.2","RawCertificate":"MIICAA=="},
                         {"RequestID":9,"CertificateTemplate":"User","RawCertificate":"MIIDAA=="}]"#;
        let certificates = ResultParser::parse_certificates(stdout);
        assert_eq!(certificates.len(), 3);
        assert_eq!(certificates[0], CertificateRecord { template: "WebServer".into(), certificate_b64: "MIIBAA==".into() });
        assert_eq!(certificates[1].template, "1.3.6.1.4.1.311.21.8.2");
        assert_eq!(certificates[2].certificate_b64, "MIIDAA==");
    }

    #[test]
    fn test_single_object_is_one_record() {
        let stdout = r#"{"CertificateTemplate":"WebServer","RawCertificate":"MIIBAA=="}"#;
        assert_eq!(ResultParser::parse_certificates(stdout).len(), 1);
    }

    #[test]
    fn test_malformed_output_is_empty() {
        for stdout in ["", "   \r\n", "[{\"RawCertificate\":", "{oops}", "null", "42", "\"text\""] {
            assert!(ResultParser::parse_certificates(stdout).is_empty(), "{stdout:?} produced records");
            assert!(ResultParser::parse_submission(stdout).is_none(), "{stdout:?} produced a submission");
        }
    }

    #[test]
    fn test_leading_warning_skipped() {
        let stdout = "WARNING: module autoloading disabled\r\n[{\"CertificateTemplate\":\"User\",\"RawCertificate\":\"MIIB\"}]\r\n";
        let certificates = ResultParser::parse_certificates(stdout);
        assert_eq!(certificates.len(), 1);
        assert_eq!(certificates[0].template, "User");
    }

    #[test]
    fn test_trailing_warning_ignored() {
        let stdout = "[{\"CertificateTemplate\":\"User\",\"RawCertificate\":\"MIIB\"}]\r\nWARNING: done\r\n";
        let certificates = ResultParser::parse_certificates(stdout);
        assert_eq!(certificates.len(), 1);
        assert_eq!(certificates[0].certificate_b64, "MIIB");

        let stdout = "{\"RequestId\":7,\"Disposition\":3,\"certificate_b64\":\"MIIB\"}\nWARNING: x\n";
        let submission = ResultParser::parse_submission(stdout).unwrap();
        assert_eq!(submission.request_id, Some(7));
        assert_eq!(submission.certificate_b64.as_deref(), Some("MIIB"));
    }

    #[test]
    fn test_rows_without_certificate_skipped() {
        let stdout = r#"[{"CertificateTemplate":"User","RawCertificate":null},{"CertificateTemplate":"User","RawCertificate":"MIIB"}]"#;
        assert_eq!(ResultParser::parse_certificates(stdout).len(), 1);
    }

    #[test]
    fn test_legacy_list_with_continuation() {
        let stdout = "\
CertificateTemplate : WebServer
RawCertificate      : MIIBAAAA
                      BBBB CCCC
                      ==

CertificateTemplate : User
RawCertificate      : MIIDDDDD
CertificateTemplate : Machine
RawCertificate      : MIIEEEEE
";
        let certificates = ResultParser::parse_certificates(stdout);
        assert_eq!(certificates.len(), 3);
        assert_eq!(certificates[0].certificate_b64, "MIIBAAAABBBBCCCC==");
        assert_eq!(certificates[1].template, "User");
        assert_eq!(certificates[2].template, "Machine");
    }

    #[test]
    fn test_field_names_case_insensitive() {
        let stdout = r#"[{"name":"WebServer","display_name":"Web Server","schema_version":1,"version":"4.1","oid":"1.2.3"},
                         {"Name":"CorpWeb","DisplayName":"Corp Web","SchemaVersion":"2","Version":"100.4","OID":"1.2.4"},
                         {"Name":null,"OID":"1.2.5"}]"#;
        let templates = ResultParser::parse_templates(stdout);
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0], TemplateDescriptor::new("WebServer", "Web Server", "1", "4.1", "1.2.3"));
        assert_eq!(templates[1], TemplateDescriptor::new("CorpWeb", "Corp Web", "2", "100.4", "1.2.4"));
    }

    #[test]
    fn test_template_defaults() {
        let templates = ResultParser::parse_templates(r#"[{"Name":"Legacy","Version":null,"OID":""}]"#);
        assert_eq!(templates[0].display_name, "Legacy");
        assert_eq!(templates[0].schema_version, "1");
        assert_eq!(templates[0].version, None);
        assert!(templates[0].is_legacy());
    }

    #[test]
    fn test_authorities() {
        let stdout = r#"[{"Name":"Corp CA","DisplayName":"Corp CA","ComputerName":"ca01","ConfigString":"ca01\\Corp CA",
                          "Type":"Enterprise Root CA","IsEnterprise":true,"IsRoot":true,"IsAccessible":true,"ServiceStatus":"Running"},
                         {"Name":"Ghost","ConfigString":""}]"#;
        let cas = ResultParser::parse_authorities(stdout);
        assert_eq!(cas.len(), 1);
        assert_eq!(cas[0].config_string, r"ca01\Corp CA");
        assert_eq!(cas[0].ca_type, "Enterprise Root CA");
        assert!(cas[0].is_enterprise && cas[0].is_root && cas[0].is_accessible);
    }

    #[test]
    fn test_legacy_authorities_booleans() {
        let stdout = "Name         : Corp CA\nConfigString : ca01\\Corp CA\nIsRoot       : True\nIsEnterprise : False\n";
        let cas = ResultParser::parse_authorities(stdout);
        assert_eq!(cas.len(), 1);
        assert!(cas[0].is_root);
        assert!(!cas[0].is_enterprise);
        assert_eq!(cas[0].display_name, "Corp CA");
    }

    #[test]
    fn test_identified_rows() {
        let stdout = r#"[{"SerialNumber":"0a1b","CertificateTemplate":"WebServer","Request.Disposition":20,"RequestID":5,"ConfigString":"ca01\\CA"}]"#;
        let rows = ResultParser::parse_identified(stdout);
        assert_eq!(
            rows,
            vec![IdentifiedCertificate {
                certificate_template: "WebServer".into(),
                serial_number: "0a1b".into(),
                config_string: r"ca01\CA".into(),
            }]
        );
    }

    #[test]
    fn test_submission() {
        let stdout = r#"{"request_id":42,"disposition":3,"certificate_b64":"MIIB"}"#;
        let submission = ResultParser::parse_submission(stdout).unwrap();
        assert_eq!(submission.request_id, Some(42));
        assert_eq!(submission.disposition, Some(3));
        assert_eq!(submission.certificate_b64.as_deref(), Some("MIIB"));

        let pending = ResultParser::parse_submission(r#"{"request_id":"43","disposition":5,"certificate_b64":null}"#).unwrap();
        assert_eq!(pending.request_id, Some(43));
        assert_eq!(pending.certificate_b64, None);
    }

    mod proptests {
        use proptest::prelude::*;
        use serde_json::Value;

        use crate::parser::ResultParser;

        proptest! {
            /// Arbitrary output never panics the parser.
            #[test]
            fn arbitrary_output_is_tolerated(stdout in "\\PC*") {
                let _ = ResultParser::parse_certificates(&stdout);
                let _ = ResultParser::parse_templates(&stdout);
                let _ = ResultParser::parse_authorities(&stdout);
                let _ = ResultParser::parse_submission(&stdout);
            }

            /// Every JSON certificate row survives parsing unchanged.
            #[test]
            fn json_rows_preserved(
                rows in proptest::collection::vec(("[A-Za-z0-9.]{0,40}", "[A-Za-z0-9+/]{1,80}={0,2}"), 0..20),
            ) {
                let json: Vec<Value> = rows
                    .iter()
                    .map(|(template, cert)| serde_json::json!({ "CertificateTemplate": template, "RawCertificate": cert }))
                    .collect();
                let parsed = ResultParser::parse_certificates(&Value::Array(json).to_string());
                prop_assert_eq!(parsed.len(), rows.len());
                for (record, (template, cert)) in parsed.iter().zip(&rows) {
                    prop_assert_eq!(&record.template, template);
                    prop_assert_eq!(&record.certificate_b64, cert);
                }
            }
        }
    }
}
