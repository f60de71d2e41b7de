//! Certificate lifecycle operations against one CA host.

use adcs_connector_cmc::CmcEncoder;
use adcs_connector_remoting::{RemoteResult, RemoteTarget, ScriptExecutor};

use crate::{
    config::ServiceConfig,
    error::{CaError, Result},
    model::{
        AuthorityDescriptor, CaRecord, CaSelection, DiscoveredCertificate, DiscoveryRequest, IdentifyResponse,
        IssueRequest, IssuedCertificate, RenewRequest, RequestFormat, TemplateDescriptor,
    },
    parser::ResultParser,
    revocation::RevocationReason,
    script::ScriptEncoder,
    serial::certificate_serial,
};

/// Message of the validation error raised when the CA returns no certificate.
pub const EMPTY_CERTIFICATE_MESSAGE: &str = "Output of the certificate is empty, check the logs of the ADCS server.";

/// CA operations over a [`ScriptExecutor`].
///
/// Each operation renders one script, runs it on the target host and parses
/// what it printed. Listing and discovery degrade to empty results when the
/// output cannot be parsed; a failed script or transport is always an error.
#[derive(Debug)]
pub struct CaService<E> {
    executor: E,
    scripts: ScriptEncoder,
    cmc: CmcEncoder,
    config: ServiceConfig,
}

impl<E: ScriptExecutor> CaService<E> {
    /// Creates a service.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Config`] if `config` is invalid.
    pub fn new(executor: E, config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { executor, scripts: ScriptEncoder::new(), cmc: CmcEncoder::new(), config })
    }

    /// The executor scripts run on.
    #[must_use]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// The service configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Verifies that the host accepts the credentials and runs PowerShell.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Remoting`] if the host cannot be reached or the
    /// script fails.
    #[tracing::instrument(skip(self, target), fields(host = %target.host))]
    pub async fn check_connection(&self, target: &RemoteTarget) -> Result<()> {
        let result = self.run(target, &self.scripts.verify_connection()).await?;
        tracing::debug!(powershell = %result.stdout_text().trim(), "Connection verified");
        Ok(())
    }

    /// Lists the CAs visible from the host.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Remoting`] if the script fails.
    #[tracing::instrument(skip(self, target), fields(host = %target.host))]
    pub async fn list_authorities(&self, target: &RemoteTarget) -> Result<Vec<CaRecord>> {
        let result = self.run(target, &self.scripts.list_authorities()).await?;
        let authorities = ResultParser::parse_authorities(&result.stdout_text());
        tracing::debug!(count = authorities.len(), "Listed authorities");
        Ok(authorities)
    }

    /// Lists the certificate templates published in Active Directory.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Remoting`] if the script fails.
    #[tracing::instrument(skip(self, target), fields(host = %target.host))]
    pub async fn list_templates(&self, target: &RemoteTarget) -> Result<Vec<TemplateDescriptor>> {
        let result = self.run(target, &self.scripts.list_templates()).await?;
        let templates = ResultParser::parse_templates(&result.stdout_text());
        tracing::debug!(count = templates.len(), "Listed templates");
        Ok(templates)
    }

    /// Submits a request and returns the issued certificate.
    ///
    /// CRMF requests are converted to CMC first; PKCS#10 requests are
    /// submitted as they are.
    ///
    /// # Errors
    ///
    /// - [`CaError::Validation`] for a malformed CA selection or request, or
    ///   when the CA returns no certificate
    /// - [`CaError::Encoding`] if the CRMF request cannot be converted
    /// - [`CaError::Remoting`] if submission fails or times out
    #[tracing::instrument(
        skip(self, target, request),
        fields(host = %target.host, template = %request.template.name, format = %request.format)
    )]
    pub async fn issue(&self, target: &RemoteTarget, request: &IssueRequest) -> Result<IssuedCertificate> {
        let ca = request.ca.resolve()?;
        let payload = match request.format {
            RequestFormat::Pkcs10 => request.request.clone(),
            RequestFormat::Crmf => self.cmc.encode(&request.request, &ca.name, &request.template.extension()?)?,
        };
        let script = self.scripts.submit_request(
            &payload,
            &ca,
            &request.template,
            self.config.issue_polling_interval(),
            self.config.issue_timeout(),
        )?;
        let result = self.run(target, &script).await?;

        let submission = ResultParser::parse_submission(&result.stdout_text()).unwrap_or_default();
        let Some(certificate_b64) = submission.certificate_b64 else {
            tracing::warn!(ca = %ca.config_string, request_id = ?submission.request_id, "CA returned no certificate");
            return Err(CaError::validation(EMPTY_CERTIFICATE_MESSAGE));
        };
        tracing::info!(ca = %ca.config_string, request_id = ?submission.request_id, "Certificate issued");
        Ok(IssuedCertificate { certificate_b64, request_id: submission.request_id, disposition: submission.disposition })
    }

    /// Issues a new certificate replacing `request.certificate_b64`.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Certificate`] if the existing certificate cannot be
    /// decoded, otherwise as [`CaService::issue`].
    #[tracing::instrument(skip(self, target, request), fields(host = %target.host, serial = tracing::field::Empty))]
    pub async fn renew(&self, target: &RemoteTarget, request: &RenewRequest) -> Result<IssuedCertificate> {
        let serial = certificate_serial(&request.certificate_b64)?;
        tracing::Span::current().record("serial", serial.as_str());
        tracing::info!("Renewing certificate");
        self.issue(target, &request.issue).await
    }

    /// Revokes a certificate on `ca`.
    ///
    /// # Errors
    ///
    /// - [`CaError::Certificate`] if the certificate cannot be decoded
    /// - [`CaError::Validation`] for a malformed CA selection
    /// - [`CaError::Remoting`] if the CA rejects the revocation
    #[tracing::instrument(skip(self, target, ca, certificate_b64), fields(host = %target.host))]
    pub async fn revoke(
        &self,
        target: &RemoteTarget,
        ca: &CaSelection,
        certificate_b64: &str,
        reason: RevocationReason,
    ) -> Result<()> {
        let ca = ca.resolve()?;
        let serial = certificate_serial(certificate_b64)?;
        let script = self.scripts.revoke(&ca, &serial, reason)?;
        self.run(target, &script).await?;
        tracing::info!(ca = %ca.config_string, serial = %serial, code = reason.code(), "Certificate revoked");
        Ok(())
    }

    /// Confirms that a certificate was issued by `ca` from `template`.
    ///
    /// # Errors
    ///
    /// - [`CaError::NotFound`] if the CA holds no certificate with its serial
    /// - [`CaError::Validation`] if several rows match or the template differs
    /// - [`CaError::Certificate`] if the certificate cannot be decoded
    /// - [`CaError::Remoting`] if the lookup fails
    #[tracing::instrument(
        skip(self, target, ca, template, certificate_b64),
        fields(host = %target.host, template = %template.name, serial = tracing::field::Empty)
    )]
    pub async fn identify(
        &self,
        target: &RemoteTarget,
        ca: &CaSelection,
        template: &TemplateDescriptor,
        certificate_b64: &str,
    ) -> Result<IdentifyResponse> {
        let ca = ca.resolve()?;
        let serial = certificate_serial(certificate_b64)?;
        tracing::Span::current().record("serial", serial.as_str());

        let script = self.scripts.identify_certificate(&serial, &ca)?;
        let result = self.run(target, &script).await?;
        let rows = ResultParser::parse_identified(&result.stdout_text());
        let row = match rows.as_slice() {
            [] => return Err(CaError::not_found("Certificate not found")),
            [row] => row,
            _ => return Err(CaError::validation("More than one certificate found")),
        };
        if !template.matches(&row.certificate_template) {
            return Err(CaError::validation(format!(
                "Certificate template '{}' does not match '{}'",
                row.certificate_template, template.name
            )));
        }
        Ok(IdentifyResponse::default())
    }

    /// Finds the certificates held by the requested CAs.
    ///
    /// Without authorities every CA the host lists is searched. Each CA is
    /// searched once per requested template, or once without a template
    /// restriction, paging until a page comes back short.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Validation`] for a malformed CA selection and
    /// [`CaError::Remoting`] if any query fails.
    #[tracing::instrument(
        skip(self, target, request),
        fields(host = %target.host, authorities = request.authorities.len(), templates = request.templates.len())
    )]
    pub async fn discover(&self, target: &RemoteTarget, request: &DiscoveryRequest) -> Result<Vec<DiscoveredCertificate>> {
        let authorities = if request.authorities.is_empty() {
            self.list_authorities(target).await?
        } else {
            request.authorities.iter().map(CaSelection::resolve).collect::<Result<Vec<_>>>()?
        };
        let templates: Vec<Option<&TemplateDescriptor>> = if request.templates.is_empty() {
            vec![None]
        } else {
            request.templates.iter().map(Some).collect()
        };

        let mut found = Vec::new();
        for ca in &authorities {
            for template in &templates {
                self.discover_pages(target, ca, *template, request, &mut found).await?;
            }
        }
        tracing::info!(count = found.len(), "Discovery finished");
        Ok(found)
    }

    async fn discover_pages(
        &self,
        target: &RemoteTarget,
        ca: &AuthorityDescriptor,
        template: Option<&TemplateDescriptor>,
        request: &DiscoveryRequest,
        found: &mut Vec<DiscoveredCertificate>,
    ) -> Result<()> {
        let page_size = self.config.search_page_size();
        let mut page = 1;
        loop {
            let script = self.scripts.dump_certificates(ca, template, request.issued_after, page, page_size)?;
            let result = self.run(target, &script).await?;
            let records = ResultParser::parse_certificates(&result.stdout_text());
            let count = records.len();
            tracing::debug!(
                ca = %ca.config_string,
                template = template.map_or("", |t| t.name.as_str()),
                page,
                count,
                "Fetched certificate page",
            );
            found.extend(records.into_iter().map(|record| DiscoveredCertificate::new(&ca.name, record)));
            if count < page_size as usize {
                return Ok(());
            }
            page += 1;
        }
    }

    async fn run(&self, target: &RemoteTarget, script: &str) -> Result<RemoteResult> {
        tracing::trace!(script, "Running CA script");
        Ok(self.executor.invoke(target, script).await?.check()?)
    }
}
