//! Wildland path resolution
//!
//! Resolution starts in the local catalog of the initial owner and walks
//! the path segment by segment. A segment can land on:
//!
//! - a **container**: the walk continues *inside* it; its storages are
//!   searched for manifest files matching the next segment (a container
//!   whose storages hold other manifests is a catalog);
//! - a **bridge**: the walk hops to the bridge's target user after
//!   verifying that the user presents the pubkey the bridge attests to.
//!
//! Every hop consumes bridge depth; exceeding [`MAX_BRIDGE_DEPTH`] aborts
//! with [`ResolveError::Cycle`], which also bounds genuine cycles in the
//! user ↔ bridge graph. Catalog contents are cached per owner for the
//! duration of one `resolve` call.

use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::crypto::{KeyFingerprint, PublicKey};
use crate::ctx::Context;
use crate::manifest::{Manifest, ManifestError, ObjectType};
use crate::obj::{Bridge, Container, Link, StorageRef, User, UserRef};
use crate::storage::{find_manifests, with_timeout, BackendError};
use crate::wlpath::{glob_match, OwnerPrefix, WildlandPath};

/// Bridge hops allowed in one resolution.
pub const MAX_BRIDGE_DEPTH: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no manifest matches the path: {0}")]
    NotFound(String),
    #[error("untrusted manifest: {0}")]
    Untrusted(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("bridge chain exceeds depth limit of {MAX_BRIDGE_DEPTH}")]
    Cycle,
    #[error("network error: {0}")]
    Network(String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<ManifestError> for ResolveError {
    fn from(e: ManifestError) -> Self {
        ResolveError::Decode(e.to_string())
    }
}

impl From<BackendError> for ResolveError {
    fn from(e: BackendError) -> Self {
        ResolveError::Network(e.to_string())
    }
}

impl From<CatalogError> for ResolveError {
    fn from(e: CatalogError) -> Self {
        ResolveError::Decode(e.to_string())
    }
}

/// What a fully resolved path points at.
#[derive(Debug, Clone)]
pub enum Resolved {
    Container(Box<Container>),
    /// The final segment matched a bridge: its verified target user
    /// (`user import` consumes this).
    User(Box<User>),
}

/// One position in the walk.
#[derive(Debug, Clone)]
struct Step {
    owner: KeyFingerprint,
    /// Set when the previous segment landed on a container; the next
    /// segment is searched inside its storages.
    container: Option<Box<Container>>,
    /// Set right after a bridge hop.
    user: Option<Box<User>>,
    depth: usize,
}

pub struct Resolver {
    ctx: Arc<Context>,
    max_depth: usize,
    /// Owners whose `members` grants are being expanded further up the
    /// call stack. Member paths resolve through the resolver itself, and
    /// user ↔ member graphs may be cyclic; each owner expands at most once
    /// per chain.
    member_expansion: parking_lot::Mutex<std::collections::HashSet<KeyFingerprint>>,
}

impl Resolver {
    pub fn new(ctx: Arc<Context>) -> Self {
        Resolver {
            ctx,
            max_depth: MAX_BRIDGE_DEPTH,
            member_expansion: parking_lot::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Resolve a path to every matching manifest (globs may match several).
    pub async fn resolve(&self, path: &WildlandPath) -> Result<Vec<Resolved>, ResolveError> {
        let mut walk = Walk {
            resolver: self,
            catalog_cache: HashMap::new(),
        };
        walk.run(path).await
    }

    /// Resolve a path expected to name exactly one container.
    pub async fn resolve_container(&self, path: &WildlandPath) -> Result<Container, ResolveError> {
        let resolved = self.resolve(path).await?;
        resolved
            .into_iter()
            .find_map(|r| match r {
                Resolved::Container(c) => Some(*c),
                Resolved::User(_) => None,
            })
            .ok_or_else(|| ResolveError::NotFound(path.to_string()))
    }

    /// Every pubkey usable to verify manifests of this user: the manifest's
    /// own `pubkeys` plus keys of users reachable through `members`.
    ///
    /// A member grant that cannot be resolved is skipped with a warning; it
    /// must never make the rest of the user's keys unusable.
    pub async fn effective_pubkeys(&self, user: &User) -> Result<Vec<PublicKey>, ResolveError> {
        let mut keys: Vec<PublicKey> = user.pubkeys().to_vec();
        if user.members().is_empty() {
            return Ok(keys);
        }
        if !self.member_expansion.lock().insert(user.owner().clone()) {
            // already expanding this owner further up the stack
            return Ok(keys);
        }

        for member_path in user.members() {
            let path: WildlandPath = match member_path.parse() {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("skipping malformed member path {member_path:?}: {e}");
                    continue;
                }
            };
            match Box::pin(self.resolve(&path)).await {
                Ok(resolved) => {
                    for entry in resolved {
                        if let Resolved::User(member) = entry {
                            for key in member.pubkeys() {
                                if !keys.contains(key) {
                                    keys.push(*key);
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot resolve member {member_path:?}: {e}");
                }
            }
        }

        self.member_expansion.lock().remove(user.owner());
        Ok(keys)
    }

    /// Expand a user's `members` grants and register every resulting key as
    /// an acceptable signer for that user, so manifests legitimately signed
    /// by a delegated key verify through
    /// [`possible_owners`](crate::crypto::SigContext::possible_owners).
    /// Called before a chain owner's catalog manifests are loaded.
    pub async fn register_effective_pubkeys(&self, user: &User) {
        match self.effective_pubkeys(user).await {
            Ok(keys) => {
                let mut sig = self.ctx.sig.write();
                for key in keys {
                    if let Err(e) = sig.add_pubkey(key, user.owner().clone()) {
                        tracing::warn!("cannot register key for {}: {}", user.owner(), e);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("cannot expand members of {}: {}", user.owner(), e);
            }
        }
    }

    fn initial_owner(&self, path: &WildlandPath) -> Result<KeyFingerprint, ResolveError> {
        match &path.owner {
            OwnerPrefix::Default => Ok(self.ctx.config.resolve_alias("@default")?),
            OwnerPrefix::Alias(alias) => Ok(self.ctx.config.resolve_alias(alias)?),
            OwnerPrefix::Fingerprint(fpr) => Ok(fpr.clone()),
            OwnerPrefix::Hinted { fingerprint, .. } => Ok(fingerprint.clone()),
        }
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, ResolveError> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read(path)
                .await
                .map_err(|e| ResolveError::Network(format!("{url}: {e}")));
        }
        if url.starts_with("https://") || url.starts_with("http://") {
            let response = reqwest::get(url)
                .await
                .map_err(|e| ResolveError::Network(format!("{url}: {e}")))?;
            if !response.status().is_success() {
                return Err(ResolveError::Network(format!(
                    "{url}: status {}",
                    response.status()
                )));
            }
            return response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| ResolveError::Network(format!("{url}: {e}")));
        }
        Err(ResolveError::Network(format!("unsupported url: {url}")))
    }

    async fn read_link(&self, link: &Link) -> Result<Vec<u8>, ResolveError> {
        let backend = self.ctx.registry.instantiate(link.storage())?;
        with_timeout(backend.open()).await?;
        let bytes = with_timeout(backend.read(link.file())).await?;
        let _ = backend.close().await;
        Ok(bytes)
    }
}

/// A manifest found while searching a catalog.
#[derive(Debug, Clone)]
enum Node {
    Container(Box<Container>),
    Bridge(Box<Bridge>),
}

struct Walk<'r> {
    resolver: &'r Resolver,
    /// owner fingerprint → catalog nodes, cached for this call.
    catalog_cache: HashMap<KeyFingerprint, Arc<Vec<Node>>>,
}

impl<'r> Walk<'r> {
    async fn run(&mut self, path: &WildlandPath) -> Result<Vec<Resolved>, ResolveError> {
        let owner = self.resolver.initial_owner(path)?;
        let mut steps = vec![Step {
            owner,
            container: None,
            user: None,
            depth: 0,
        }];

        for segment in &path.segments {
            let mut next = Vec::new();
            for step in &steps {
                next.extend(self.expand(step, segment).await?);
            }
            if next.is_empty() {
                return Err(ResolveError::NotFound(path.to_string()));
            }
            steps = next;
        }

        let mut resolved = Vec::new();
        for step in steps {
            if let Some(container) = step.container {
                resolved.push(Resolved::Container(container));
            } else if let Some(user) = step.user {
                resolved.push(Resolved::User(user));
            }
        }
        if resolved.is_empty() {
            return Err(ResolveError::NotFound(path.to_string()));
        }
        Ok(resolved)
    }

    /// All steps one segment takes us to from `step`.
    async fn expand(&mut self, step: &Step, segment: &str) -> Result<Vec<Step>, ResolveError> {
        let nodes = match (&step.container, &step.user) {
            // inside a container: search its storages for manifests
            (Some(container), _) => self.container_nodes(container).await?,
            // right after a bridge hop: the fetched user manifest carries
            // the catalog (the target user is usually not stored locally)
            (None, Some(user)) => self.owner_nodes(&step.owner, Some(user)).await?,
            (None, None) => self.owner_nodes(&step.owner, None).await?,
        };

        let mut out = Vec::new();
        for node in nodes.iter() {
            match node {
                Node::Container(container) => {
                    let matches = container
                        .mount_paths()
                        .iter()
                        .any(|p| glob_match(segment, &p.to_string_lossy()));
                    if !matches {
                        continue;
                    }
                    if container.owner() != &step.owner {
                        return Err(ResolveError::Untrusted(format!(
                            "container owned by {} found in catalog of {}",
                            container.owner(),
                            step.owner
                        )));
                    }
                    out.push(Step {
                        owner: step.owner.clone(),
                        container: Some(container.clone()),
                        user: None,
                        depth: step.depth,
                    });
                }
                Node::Bridge(bridge) => {
                    let matches = bridge
                        .paths()
                        .iter()
                        .any(|p| glob_match(segment, &p.to_string_lossy()));
                    if !matches {
                        continue;
                    }
                    if bridge.owner() != &step.owner {
                        return Err(ResolveError::Untrusted(format!(
                            "bridge owned by {} found in catalog of {}",
                            bridge.owner(),
                            step.owner
                        )));
                    }
                    if step.depth + 1 > self.resolver.max_depth {
                        return Err(ResolveError::Cycle);
                    }
                    let user = self.bridge_target(bridge).await?;
                    out.push(Step {
                        owner: user.owner().clone(),
                        container: None,
                        user: Some(Box::new(user)),
                        depth: step.depth + 1,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Fetch and verify the user a bridge points at. The user manifest is
    /// self-signed; trust comes from the bridge's `pubkey` attestation.
    async fn bridge_target(&mut self, bridge: &Bridge) -> Result<User, ResolveError> {
        let bytes = match bridge.user() {
            UserRef::Url(url) => self.resolver.fetch_url(url).await?,
            UserRef::Link(link) => self.resolver.read_link(link).await?,
        };
        let manifest = {
            let mut sig = self.resolver.ctx.sig.write();
            Manifest::verify_and_load_pubkeys(&bytes, &mut sig)?
        };
        let user = User::try_from(manifest)?;

        if !user.owns_key(bridge.pubkey()) {
            return Err(ResolveError::Untrusted(format!(
                "bridge pubkey not among pubkeys of user {}",
                user.owner()
            )));
        }

        // the new chain owner's delegated keys become acceptable signers
        // for everything loaded from their forest
        self.resolver.register_effective_pubkeys(&user).await;
        Ok(user)
    }

    /// Catalog nodes of an owner: their locally stored containers and
    /// bridges, plus the contents of their user manifest's catalog. A user
    /// fetched through a bridge is passed in; otherwise the local catalog
    /// is consulted for one.
    async fn owner_nodes(
        &mut self,
        owner: &KeyFingerprint,
        user: Option<&User>,
    ) -> Result<Arc<Vec<Node>>, ResolveError> {
        if let Some(nodes) = self.catalog_cache.get(owner) {
            return Ok(nodes.clone());
        }

        let local_user = {
            let sig = self.resolver.ctx.sig.read();
            self.resolver.ctx.catalog.find_user(owner, &sig)
        };
        let user = user.cloned().or(local_user);

        // delegated signer keys must be in place before any of the owner's
        // catalog manifests are verified
        if let Some(user) = &user {
            self.resolver.register_effective_pubkeys(user).await;
        }

        let mut nodes = Vec::new();
        {
            let sig = self.resolver.ctx.sig.read();
            let catalog = &self.resolver.ctx.catalog;
            for container in catalog.containers(&sig) {
                if container.owner() == owner {
                    nodes.push(Node::Container(Box::new(container)));
                }
            }
            for bridge in catalog.bridges(&sig) {
                if bridge.owner() == owner {
                    nodes.push(Node::Bridge(Box::new(bridge)));
                }
            }
        }

        if let Some(user) = &user {
            for entry in user.manifests_catalog() {
                match self.catalog_entry_container(entry, owner).await {
                    Ok(container) => {
                        let inner = self.container_nodes(&container).await?;
                        nodes.extend(inner.iter().cloned());
                    }
                    Err(e) => {
                        tracing::warn!("skipping catalog entry of {}: {}", owner, e)
                    }
                }
            }
        }

        let nodes = Arc::new(nodes);
        self.catalog_cache.insert(owner.clone(), nodes.clone());
        Ok(nodes)
    }

    /// Interpret one `manifests-catalog` entry as a container.
    async fn catalog_entry_container(
        &mut self,
        entry: &serde_yaml::Value,
        owner: &KeyFingerprint,
    ) -> Result<Container, ResolveError> {
        match entry {
            serde_yaml::Value::String(url) => {
                let bytes = self.resolver.fetch_url(url).await?;
                let manifest = {
                    let sig = self.resolver.ctx.sig.read();
                    Manifest::from_bytes(&bytes, &sig, Some(ObjectType::Container), None, false)?
                };
                Ok(Container::try_from(manifest)?)
            }
            serde_yaml::Value::Mapping(map)
                if map.get("object").and_then(serde_yaml::Value::as_str) == Some("link") =>
            {
                let link = Link::from_mapping(map.clone(), owner)?;
                let bytes = self.resolver.read_link(&link).await?;
                let manifest = {
                    let sig = self.resolver.ctx.sig.read();
                    Manifest::from_bytes(&bytes, &sig, Some(ObjectType::Container), None, false)?
                };
                Ok(Container::try_from(manifest)?)
            }
            serde_yaml::Value::Mapping(map) => {
                // inline container riding inside the signed user manifest:
                // the enclosing signature already covers it
                let manifest = Manifest::from_fields(map.clone())?;
                Ok(Container::try_from(manifest)?)
            }
            _ => Err(ResolveError::Decode(
                "catalog entries must be urls, links or inline containers".into(),
            )),
        }
    }

    /// Manifests stored inside a container's storages, parsed into nodes.
    async fn container_nodes(&mut self, container: &Container) -> Result<Arc<Vec<Node>>, ResolveError> {
        let mut nodes = Vec::new();
        let mut last_error: Option<ResolveError> = None;

        for storage_ref in container.storages() {
            let StorageRef::Inline(storage) = storage_ref else {
                continue;
            };
            let backend = match self.resolver.ctx.registry.instantiate(storage) {
                Ok(backend) => backend,
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };
            if let Err(e) = with_timeout(backend.open()).await {
                last_error = Some(e.into());
                continue;
            }
            let manifests = match find_manifests(backend.as_ref(), storage.manifest_pattern()).await
            {
                Ok(manifests) => manifests,
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };
            let trusted_owner = storage.trusted().then(|| storage.owner().clone());
            for (path, bytes) in manifests {
                let manifest = {
                    let sig = self.resolver.ctx.sig.read();
                    Manifest::from_bytes(&bytes, &sig, None, trusted_owner.as_ref(), false)
                };
                match manifest {
                    Ok(manifest) => match manifest.object_type() {
                        Ok(ObjectType::Container) => match Container::try_from(manifest) {
                            Ok(c) => nodes.push(Node::Container(Box::new(c))),
                            Err(e) => tracing::debug!("bad container at {}: {}", path.display(), e),
                        },
                        Ok(ObjectType::Bridge) => match Bridge::try_from(manifest) {
                            Ok(b) => nodes.push(Node::Bridge(Box::new(b))),
                            Err(e) => tracing::debug!("bad bridge at {}: {}", path.display(), e),
                        },
                        _ => {}
                    },
                    Err(e) => {
                        tracing::debug!("skipping manifest at {}: {}", path.display(), e)
                    }
                }
            }
            let _ = backend.close().await;
            // one reachable storage is enough
            return Ok(Arc::new(nodes));
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(Arc::new(nodes)),
        }
    }
}
