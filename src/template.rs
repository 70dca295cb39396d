//! Configuration text templates
//!
//! The compiler validates and resolves everything into a [`RenderContext`];
//! a [`ConfigTemplate`] only turns that context into text. Templates never
//! see raw tenant input.

use crate::compiler::{AccessRules, PlaceholderReason, UpstreamSpec, ValidatedPolicy};
use crate::validation::{Hostname, Identifier, Slug};

/// Size of the shared memory zone backing each tenant's rate limit
const RATE_ZONE_SIZE: &str = "10m";
/// Idle keepalive connections kept per upstream
const UPSTREAM_KEEPALIVE: u32 = 32;

/// Everything a template needs to render one `(tenant, domain)` artifact
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub tenant_id: &'a Identifier,
    pub slug: &'a Slug,
    pub domain: &'a Hostname,
    /// The tenant's first domain in sorted order; its artifact carries the
    /// upstream block and rate-limit zone shared by all of the tenant's domains
    pub primary_domain: &'a Hostname,
    pub upstream: &'a UpstreamSpec,
    pub rate_zone: &'a str,
    pub policy: &'a ValidatedPolicy,
    pub generated_at: Option<&'a str>,
    pub acme_webroot: Option<&'a str>,
}

impl RenderContext<'_> {
    /// Whether this artifact defines the tenant-wide upstream and zone
    pub fn defines_shared(&self) -> bool {
        self.domain == self.primary_domain
    }
}

/// Strategy that turns a validated context into configuration text
pub trait ConfigTemplate: Send + Sync {
    /// Render a routed artifact. Must be deterministic in `ctx`.
    fn render(&self, ctx: &RenderContext<'_>) -> String;

    /// Render a comment-only artifact for a tenant that cannot be routed yet
    fn render_placeholder(
        &self,
        slug: &Slug,
        domain: Option<&Hostname>,
        reason: PlaceholderReason,
    ) -> String {
        match (reason, domain) {
            (PlaceholderReason::NoDomains, _) => {
                format!("# No domains configured for tenant {}\n", slug)
            }
            (PlaceholderReason::NoUpstream, Some(domain)) => format!(
                "# No upstream pool configured for tenant {}\n# {} is not routed until one is added\n",
                slug, domain
            ),
            (PlaceholderReason::NoUpstream, None) => {
                format!("# No upstream pool configured for tenant {}\n", slug)
            }
        }
    }
}

/// Inline nginx renderer
#[derive(Debug, Clone, Copy, Default)]
pub struct NginxTemplate;

impl ConfigTemplate for NginxTemplate {
    fn render(&self, ctx: &RenderContext<'_>) -> String {
        let mut out: Vec<String> = Vec::new();

        out.push("# Managed by edgeplane. Do not edit.".to_string());
        out.push(format!("# Tenant: {}", ctx.tenant_id));
        out.push(format!("# Slug: {}", ctx.slug));
        out.push(format!("# Domain: {}", ctx.domain));
        if let Some(generated_at) = ctx.generated_at {
            out.push(format!("# Generated at: {}", generated_at));
        }
        out.push(String::new());

        if ctx.defines_shared() {
            let limit = ctx.policy.rate_limit;
            out.push(format!(
                "limit_req_zone $binary_remote_addr zone={}:{} rate={}r/s;",
                ctx.rate_zone, RATE_ZONE_SIZE, limit.rps
            ));
            out.push(String::new());
            out.push(format!("upstream {} {{", ctx.upstream.name));
            for server in &ctx.upstream.servers {
                out.push(format!(
                    "    server {}:{} weight={};",
                    server.host, server.port, server.weight
                ));
            }
            out.push(format!("    keepalive {};", UPSTREAM_KEEPALIVE));
            out.push("}".to_string());
        } else {
            out.push(format!(
                "# Upstream {} and zone {} are defined in {}_{}.conf",
                ctx.upstream.name, ctx.rate_zone, ctx.slug, ctx.primary_domain
            ));
        }
        out.push(String::new());

        out.push("server {".to_string());
        out.push("    listen 80;".to_string());
        out.push("    listen [::]:80;".to_string());
        out.push(format!("    server_name {};", ctx.domain));

        if let Some(webroot) = ctx.acme_webroot {
            out.push(String::new());
            out.push("    location /.well-known/acme-challenge/ {".to_string());
            out.push("        allow all;".to_string());
            out.push(format!("        root {};", webroot));
            out.push("    }".to_string());
        }

        let security = security_headers(ctx.policy);
        if !security.is_empty() || !ctx.policy.headers.is_empty() {
            out.push(String::new());
        }
        for (name, value) in security {
            out.push(format!("    add_header {} {} always;", name, quote(value)));
        }
        for (name, value) in &ctx.policy.headers {
            out.push(format!(
                "    add_header {} {} always;",
                name,
                quote(value.as_str())
            ));
        }

        match &ctx.policy.access {
            AccessRules::Open => {}
            AccessRules::AllowOnly(rules) => {
                out.push(String::new());
                for rule in rules {
                    out.push(format!("    allow {};", rule));
                }
                out.push("    deny all;".to_string());
            }
            AccessRules::Deny(rules) => {
                out.push(String::new());
                for rule in rules {
                    out.push(format!("    deny {};", rule));
                }
            }
        }

        out.push(String::new());
        out.push("    location / {".to_string());
        out.push(format!(
            "        limit_req zone={} burst={} nodelay;",
            ctx.rate_zone, ctx.policy.rate_limit.burst
        ));
        out.push("        proxy_http_version 1.1;".to_string());
        out.push("        proxy_set_header Connection \"\";".to_string());
        out.push("        proxy_set_header Host $host;".to_string());
        out.push("        proxy_set_header X-Real-IP $remote_addr;".to_string());
        out.push(
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;".to_string(),
        );
        out.push("        proxy_set_header X-Forwarded-Proto $scheme;".to_string());
        out.push(format!(
            "        proxy_set_header X-Tenant-Id {};",
            quote(ctx.tenant_id.as_str())
        ));
        out.push(format!(
            "        proxy_set_header X-Tenant-Slug {};",
            quote(ctx.slug.as_str())
        ));
        out.push(format!("        proxy_pass http://{};", ctx.upstream.name));
        out.push("        proxy_connect_timeout 5s;".to_string());
        out.push("        proxy_read_timeout 60s;".to_string());
        out.push("    }".to_string());
        out.push("}".to_string());

        let mut text = out.join("\n");
        text.push('\n');
        text
    }
}

/// Security headers enabled by the policy, in fixed order
fn security_headers(policy: &ValidatedPolicy) -> Vec<(&'static str, &'static str)> {
    let flags = policy.security;
    let mut headers = Vec::new();
    if flags.hsts {
        headers.push((
            "Strict-Transport-Security",
            "max-age=31536000; includeSubDomains",
        ));
    }
    if flags.x_frame_options {
        headers.push(("X-Frame-Options", "SAMEORIGIN"));
    }
    if flags.x_content_type_options {
        headers.push(("X-Content-Type-Options", "nosniff"));
    }
    if flags.csp {
        headers.push(("Content-Security-Policy", "default-src 'self';"));
    }
    headers
}

/// Double-quote a value for an nginx directive argument
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
