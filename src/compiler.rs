//! Config compiler: tenant graph in, per-domain proxy configuration out
//!
//! Compilation is a pure function of the tenant graph and [`RenderOptions`].
//! Every tenant-controlled string is validated before it can reach a
//! template, and any validation failure rejects the whole tenant rather than
//! silently dropping the offending field.

use crate::model::{content_hash, EdgePolicy, RateLimit, RenderedFile, SecurityHeaders, Tenant};
use crate::template::{ConfigTemplate, NginxTemplate, RenderContext};
use crate::validation::{
    managed_filename, validate_header_name, validate_header_value, validate_hostname,
    validate_identifier, validate_ip_or_cidr, validate_slug, HeaderName, HeaderValue, Hostname,
    IpRule, Slug, ValidationError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Rate limit applied when a tenant has no policy or the policy sets none
pub const DEFAULT_RATE_LIMIT: RateLimit = RateLimit { rps: 10, burst: 20 };

/// Weight of a target that does not specify one
pub const DEFAULT_TARGET_WEIGHT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A tenant-supplied field failed validation; nothing was rendered
    #[error("security validation failed for tenant {tenant:?}: {source}")]
    SecurityValidation {
        tenant: String,
        #[source]
        source: ValidationError,
    },
}

impl CompileError {
    fn security(tenant: &Tenant, source: ValidationError) -> Self {
        CompileError::SecurityValidation {
            tenant: tenant.slug.clone(),
            source,
        }
    }
}

/// Why an artifact contains only an explanatory comment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderReason {
    NoDomains,
    NoUpstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Routed,
    Placeholder(PlaceholderReason),
}

/// Generated configuration text for one `(tenant, domain)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub slug: Slug,
    /// `None` only for the placeholder of a tenant without domains
    pub domain: Option<Hostname>,
    pub kind: ArtifactKind,
    pub content: String,
}

impl ConfigArtifact {
    /// `<slug>_<domain>.conf`, or `None` when there is no domain to key on
    pub fn filename(&self) -> Option<String> {
        self.domain
            .as_ref()
            .map(|domain| managed_filename(&self.slug, domain))
    }

    pub fn into_file(self) -> Option<RenderedFile> {
        let filename = self.filename()?;
        Some(RenderedFile::new(filename, self.content))
    }
}

/// One validated backend server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamServer {
    pub host: Hostname,
    pub port: u16,
    pub weight: u32,
}

/// Upstream block shared by all of a tenant's domains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSpec {
    /// `upstream_<slug>_<pool>`: unique across tenants because slugs
    /// contain no underscores, and stable across re-renders
    pub name: String,
    pub servers: Vec<UpstreamServer>,
}

/// IP access rules after precedence has been resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AccessRules {
    #[default]
    Open,
    /// Allow these, deny everything else
    AllowOnly(Vec<IpRule>),
    /// Deny these, allow everything else
    Deny(Vec<IpRule>),
}

/// Edge policy after boundary validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPolicy {
    pub rate_limit: RateLimit,
    pub security: SecurityHeaders,
    /// Sorted by header name
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub access: AccessRules,
}

impl Default for ValidatedPolicy {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT,
            security: SecurityHeaders::default(),
            headers: Vec::new(),
            access: AccessRules::Open,
        }
    }
}

impl ValidatedPolicy {
    /// Validate a raw policy. Absent policy means defaults.
    ///
    /// Both IP lists are validated even though the deny list is ignored when
    /// an allow list is present, so bad data is reported instead of lingering.
    pub fn from_policy(policy: Option<&EdgePolicy>) -> Result<Self, ValidationError> {
        let Some(policy) = policy else {
            return Ok(Self::default());
        };

        let headers = policy
            .headers
            .iter()
            .map(|(name, value)| Ok((validate_header_name(name)?, validate_header_value(value)?)))
            .collect::<Result<Vec<_>, ValidationError>>()?;

        let allow = policy
            .ip_allow_list
            .iter()
            .map(|ip| validate_ip_or_cidr(ip.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        let deny = policy
            .ip_deny_list
            .iter()
            .map(|ip| validate_ip_or_cidr(ip.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        let access = if !allow.is_empty() {
            if !deny.is_empty() {
                debug!(
                    allow = allow.len(),
                    deny = deny.len(),
                    "Both IP lists set, allow list takes precedence"
                );
            }
            AccessRules::AllowOnly(allow)
        } else if !deny.is_empty() {
            AccessRules::Deny(deny)
        } else {
            AccessRules::Open
        };

        Ok(Self {
            rate_limit: policy.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT),
            security: policy.security_headers,
            headers,
            access,
        })
    }
}

/// Knobs that are not part of the tenant graph
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Written as a comment when set. Leave unset for byte-stable output
    /// across renders of unchanged data.
    pub generated_at: Option<String>,
    /// Serve `/.well-known/acme-challenge/` from this directory when set
    pub acme_webroot: Option<String>,
}

/// A tenant that could not be rendered during a render-all pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantFailure {
    pub tenant: String,
    pub error: String,
}

/// Result of rendering every tenant
#[derive(Debug, Clone)]
pub struct RenderReport {
    /// Sorted by filename
    pub files: Vec<RenderedFile>,
    /// [`content_hash`] of `files`
    pub hash: String,
    pub failures: Vec<TenantFailure>,
    /// Tenants without domains; their placeholder has no filename
    pub unrouted: Vec<String>,
}

impl RenderReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Compiles tenants with a pluggable template
pub struct Compiler<T = NginxTemplate> {
    template: T,
    options: RenderOptions,
}

impl Compiler<NginxTemplate> {
    pub fn new(options: RenderOptions) -> Self {
        Self::with_template(NginxTemplate, options)
    }
}

impl<T: ConfigTemplate> Compiler<T> {
    pub fn with_template(template: T, options: RenderOptions) -> Self {
        Self { template, options }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Compile one tenant into one artifact per domain.
    pub fn compile(&self, tenant: &Tenant) -> Result<Vec<ConfigArtifact>, CompileError> {
        let slug = validate_slug(&tenant.slug).map_err(|e| CompileError::security(tenant, e))?;

        if tenant.domains.is_empty() {
            let content = self
                .template
                .render_placeholder(&slug, None, PlaceholderReason::NoDomains);
            return Ok(vec![ConfigArtifact {
                slug,
                domain: None,
                kind: ArtifactKind::Placeholder(PlaceholderReason::NoDomains),
                content,
            }]);
        }

        let mut domains = tenant
            .domains
            .iter()
            .map(|d| validate_hostname(d))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CompileError::security(tenant, e))?;
        domains.sort();
        domains.dedup();

        let tenant_id =
            validate_identifier(&tenant.id).map_err(|e| CompileError::security(tenant, e))?;

        let upstream = match tenant.pools.first() {
            Some(pool) if !pool.targets.is_empty() => {
                let pool_name = validate_identifier(&pool.name)
                    .map_err(|e| CompileError::security(tenant, e))?;
                let servers = pool
                    .targets
                    .iter()
                    .map(validate_target)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| CompileError::security(tenant, e))?;
                UpstreamSpec {
                    name: format!("upstream_{}_{}", slug, pool_name),
                    servers,
                }
            }
            _ => {
                debug!(tenant = %slug, "No routable upstream pool, rendering placeholders");
                return Ok(domains
                    .into_iter()
                    .map(|domain| ConfigArtifact {
                        content: self.template.render_placeholder(
                            &slug,
                            Some(&domain),
                            PlaceholderReason::NoUpstream,
                        ),
                        slug: slug.clone(),
                        domain: Some(domain),
                        kind: ArtifactKind::Placeholder(PlaceholderReason::NoUpstream),
                    })
                    .collect());
            }
        };

        let policy = ValidatedPolicy::from_policy(tenant.policy.as_ref())
            .map_err(|e| CompileError::security(tenant, e))?;
        let rate_zone = format!("tenant_{}_limit", slug);
        let primary_domain = &domains[0];

        let artifacts = domains
            .iter()
            .map(|domain| {
                let ctx = RenderContext {
                    tenant_id: &tenant_id,
                    slug: &slug,
                    domain,
                    primary_domain,
                    upstream: &upstream,
                    rate_zone: &rate_zone,
                    policy: &policy,
                    generated_at: self.options.generated_at.as_deref(),
                    acme_webroot: self.options.acme_webroot.as_deref(),
                };
                ConfigArtifact {
                    slug: slug.clone(),
                    domain: Some(domain.clone()),
                    kind: ArtifactKind::Routed,
                    content: self.template.render(&ctx),
                }
            })
            .collect();

        Ok(artifacts)
    }

    /// Render every tenant. A failing tenant is reported and skipped; it
    /// never aborts the others.
    pub fn compile_all(&self, tenants: &[Tenant]) -> RenderReport {
        let mut files = Vec::new();
        let mut failures = Vec::new();
        let mut unrouted = Vec::new();

        for tenant in tenants {
            match self.compile(tenant) {
                Ok(artifacts) => {
                    for artifact in artifacts {
                        let slug = artifact.slug.to_string();
                        match artifact.into_file() {
                            Some(file) => files.push(file),
                            None => unrouted.push(slug),
                        }
                    }
                }
                Err(e) => {
                    warn!(tenant = %tenant.slug, error = %e, "Tenant rejected during render");
                    failures.push(TenantFailure {
                        tenant: tenant.slug.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        let hash = content_hash(&files);

        RenderReport {
            files,
            hash,
            failures,
            unrouted,
        }
    }
}

fn validate_target(target: &crate::model::Target) -> Result<UpstreamServer, ValidationError> {
    let host = validate_hostname(&target.host)?;
    let describe = || format!("{}:{}", target.host, target.port);

    if target.port == 0 {
        return Err(ValidationError::Target {
            value: describe(),
            reason: "port must be greater than 0",
        });
    }
    let weight = target.weight.unwrap_or(DEFAULT_TARGET_WEIGHT);
    if weight == 0 {
        return Err(ValidationError::Target {
            value: describe(),
            reason: "weight must be at least 1",
        });
    }

    Ok(UpstreamServer {
        host,
        port: target.port,
        weight,
    })
}
