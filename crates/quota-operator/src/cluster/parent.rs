use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use http::Uri;
use kube::{Client, Config};
use snafu::{OptionExt, ResultExt, Snafu};

/// API group of the supported parent context kind.
pub const PROJECT_GROUP: &str = "resourcemanager.miloapis.com";

/// The only parent context kind the resolver supports.
pub const PROJECT_KIND: &str = "Project";

/// How long a resolved parent client stays cached.
pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(60 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unsupported parent context kind {kind}.{group}, only Project is supported"))]
    UnsupportedParentContext { group: String, kind: String },

    #[snafu(display("local base URL {uri} has no scheme or authority"))]
    MalformedBaseUrl { uri: Uri },

    #[snafu(display("failed to build control plane URL for project {project:?}"))]
    BuildControlPlaneUrl {
        source: http::Error,
        project: String,
    },

    #[snafu(display("failed to construct client for project {project:?}"))]
    ConstructClient {
        source: kube::Error,
        project: String,
    },
}

struct CachedClient {
    client: Client,
    expires_at: Instant,
}

/// Produces record clients for named parent contexts.
///
/// A parent context is another control plane reachable through the local
/// server: for a `Project` the base URL path is rewritten to the project's
/// control plane endpoint and the local auth material is reused. Clients
/// are cached with a TTL; a background sweeper removes expired entries and
/// access evicts them lazily.
pub struct ParentContextResolver {
    base: Config,
    ttl: Duration,
    cache: Arc<Mutex<HashMap<String, CachedClient>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ParentContextResolver {
    pub fn new(base: Config, ttl: Duration) -> Arc<Self> {
        let cache = Arc::new(Mutex::new(HashMap::<String, CachedClient>::new()));
        let sweeper = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    let now = Instant::now();
                    cache
                        .lock()
                        .expect("parent client cache lock poisoned")
                        .retain(|_, cached| cached.expires_at > now);
                }
            })
        };

        Arc::new(Self {
            base,
            ttl,
            cache,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Whether this resolver can produce clients for the given kind.
    pub fn supports(&self, group: &str, kind: &str) -> bool {
        group == PROJECT_GROUP && kind == PROJECT_KIND
    }

    /// Resolves a client for the named parent context, from cache when
    /// fresh.
    pub fn resolve(&self, group: &str, kind: &str, name: &str) -> Result<Client, Error> {
        if !self.supports(group, kind) {
            return UnsupportedParentContextSnafu {
                group: group.to_owned(),
                kind: kind.to_owned(),
            }
            .fail();
        }

        let mut cache = self.cache.lock().expect("parent client cache lock poisoned");
        if let Some(cached) = cache.get(name) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.client.clone());
            }
            cache.remove(name);
        }

        let mut config = self.base.clone();
        config.cluster_url = project_control_plane_url(&self.base.cluster_url, name)?;
        let client = Client::try_from(config).context(ConstructClientSnafu {
            project: name.to_owned(),
        })?;

        cache.insert(
            name.to_owned(),
            CachedClient {
                client: client.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(client)
    }

    /// Stops the background sweeper and drops all cached clients.
    pub fn close(&self) {
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .expect("parent resolver sweeper lock poisoned")
            .take()
        {
            sweeper.abort();
        }
        self.cache
            .lock()
            .expect("parent client cache lock poisoned")
            .clear();
    }
}

/// Rewrites the local base URL's path to the project's control plane
/// endpoint, keeping scheme and authority.
fn project_control_plane_url(base: &Uri, project: &str) -> Result<Uri, Error> {
    let parts = base.clone().into_parts();
    let scheme = parts.scheme.with_context(|| MalformedBaseUrlSnafu { uri: base.clone() })?;
    let authority = parts
        .authority
        .with_context(|| MalformedBaseUrlSnafu { uri: base.clone() })?;

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(format!(
            "/apis/resourcemanager.miloapis.com/v1alpha1/projects/{project}/control-plane"
        ))
        .build()
        .context(BuildControlPlaneUrlSnafu {
            project: project.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_path_and_keeps_authority() {
        let base: Uri = "https://api.example.com:6443/".parse().expect("test uri");

        let url = project_control_plane_url(&base, "phoenix").expect("derived url");

        assert_eq!(
            url.to_string(),
            "https://api.example.com:6443/apis/resourcemanager.miloapis.com/v1alpha1/projects/phoenix/control-plane"
        );
    }

    #[test]
    fn replaces_an_existing_path() {
        let base: Uri = "https://api.example.com/some/prefix".parse().expect("test uri");

        let url = project_control_plane_url(&base, "phoenix").expect("derived url");

        assert!(url.path().starts_with("/apis/resourcemanager.miloapis.com"));
    }

    #[test]
    fn relative_base_url_is_rejected() {
        let base: Uri = "/only/a/path".parse().expect("test uri");

        assert!(matches!(
            project_control_plane_url(&base, "phoenix"),
            Err(Error::MalformedBaseUrl { .. })
        ));
    }

    #[tokio::test]
    async fn unsupported_kind_is_rejected() {
        let config = Config::new("https://api.example.com".parse().expect("test uri"));
        let resolver = ParentContextResolver::new(config, DEFAULT_CLIENT_TTL);

        let outcome = resolver.resolve("resourcemanager.miloapis.com", "Folder", "phoenix");

        assert!(matches!(outcome, Err(Error::UnsupportedParentContext { .. })));
        resolver.close();
    }
}
