//! List navigation for one signed-in identity.
//!
//! A [`Workspace`] keeps at most one list open. Opening a list resolves it
//! through the registry, wraps it in a [`TaskService`] and starts the
//! background refresh that keeps the task snapshot current. Switching away
//! stops that refresh and closes the handle.

use std::sync::Arc;

use thiserror::Error;

use tasklane_proto::registry::{EncryptionConfig, ROOT_LIST_NAME};

use crate::config::ClientConfig;
use crate::confirm::{ConfirmationGate, IdentityConfirmer};
use crate::crypto::stub::STUB_METHOD;
use crate::identity::IdentityWatch;
use crate::migrate::{self, MigrationError, MigrationReport};
use crate::registry::{PathSegment, RegistryError, RegistrySession, validate_list_name};
use crate::store::{LogProvider, LogStore};
use crate::tasks::manager::Clock;
use crate::tasks::{TaskError, TaskService};

/// Errors that can occur while navigating lists.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// No list is open.
    #[error("no list is open")]
    NoListOpen,
    /// The open list has no parent.
    #[error("{0} is already at the top of the hierarchy")]
    AtRoot(String),
    /// Registry lookup or resolution failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Migration failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),
    /// Loading the list's tasks failed.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// The list currently open in a [`Workspace`].
pub struct OpenList<S: LogStore, C: IdentityConfirmer> {
    /// Display name.
    pub name: String,
    /// Parent recorded in the registry.
    pub parent: Option<String>,
    /// Mutation surface over the list.
    pub tasks: Arc<TaskService<S, C>>,
    refresh: tokio::task::JoinHandle<()>,
}

impl<S: LogStore, C: IdentityConfirmer> Drop for OpenList<S, C> {
    fn drop(&mut self) {
        self.refresh.abort();
    }
}

/// Navigation state over the registry.
pub struct Workspace<P: LogProvider, C: IdentityConfirmer> {
    registry: Arc<RegistrySession<P>>,
    gate: Arc<ConfirmationGate<C>>,
    max_text_len: usize,
    default_encryption: EncryptionConfig,
    clock: Option<Clock>,
    current: Option<OpenList<P::Store, C>>,
}

impl<P, C> Workspace<P, C>
where
    P: LogProvider,
    C: IdentityConfirmer + 'static,
{
    /// Creates a workspace with nothing open.
    #[must_use]
    pub fn new(registry: Arc<RegistrySession<P>>, gate: Arc<ConfirmationGate<C>>) -> Self {
        Self {
            registry,
            gate,
            max_text_len: tasklane_proto::task::MAX_TASK_TEXT_LENGTH,
            default_encryption: EncryptionConfig::encrypted(STUB_METHOD),
            clock: None,
            current: None,
        }
    }

    /// Builds the registry session, confirmation gate and list settings
    /// from `config`.
    #[must_use]
    pub fn from_config(
        config: &ClientConfig,
        provider: Arc<P>,
        identity: IdentityWatch,
        confirmer: C,
    ) -> Self {
        let registry = Arc::new(RegistrySession::new(
            provider,
            identity,
            config.registry_settings(),
        ));
        let gate = Arc::new(ConfirmationGate::new(confirmer, config.confirm_timeout));
        Self::new(registry, gate)
            .with_max_text_len(config.max_task_text_len)
            .with_default_encryption(config.default_encryption())
    }

    /// Sets the maximum task text length for opened lists.
    #[must_use]
    pub fn with_max_text_len(mut self, max: usize) -> Self {
        self.max_text_len = max;
        self
    }

    /// Sets the configuration [`Self::toggle_encryption`] migrates to.
    #[must_use]
    pub fn with_default_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.default_encryption = encryption;
        self
    }

    /// The confirmation gate shared by opened lists.
    #[must_use]
    pub const fn gate(&self) -> &Arc<ConfirmationGate<C>> {
        &self.gate
    }

    /// Replaces the clock used by opened lists.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// The registry session.
    #[must_use]
    pub const fn registry(&self) -> &Arc<RegistrySession<P>> {
        &self.registry
    }

    /// The open list, if any.
    #[must_use]
    pub const fn current(&self) -> Option<&OpenList<P::Store, C>> {
        self.current.as_ref()
    }

    /// Tasks service of the open list.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NoListOpen`] if nothing is open.
    pub fn tasks(&self) -> Result<&Arc<TaskService<P::Store, C>>, WorkspaceError> {
        self.current
            .as_ref()
            .map(|open| &open.tasks)
            .ok_or(WorkspaceError::NoListOpen)
    }

    /// Opens the list registered as `name`.
    ///
    /// A name the registry does not know yet is created under the root
    /// list.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkspaceError`] if the name is invalid, the list cannot
    /// be resolved, or its tasks cannot be loaded. The previously open
    /// list stays open on error.
    pub async fn switch_list(&mut self, name: &str) -> Result<&OpenList<P::Store, C>, WorkspaceError> {
        validate_list_name(name)?;
        self.registry.list_available().await?;
        let parent = if name == ROOT_LIST_NAME || self.registry.find(name).is_some() {
            None
        } else {
            Some(ROOT_LIST_NAME)
        };
        self.open(name, parent).await
    }

    /// Creates `name` as a sub-list of the open list (or of the root list
    /// when nothing is open) and switches to it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] if any list already uses
    /// the name, or a resolution error.
    pub async fn create_sub_list(&mut self, name: &str) -> Result<&OpenList<P::Store, C>, WorkspaceError> {
        validate_list_name(name)?;
        self.registry.list_available().await?;
        if let Some(existing) = self.registry.find(name) {
            return Err(RegistryError::DuplicateName {
                name: name.to_string(),
                parent: existing
                    .entry
                    .parent
                    .unwrap_or_else(|| "(none)".to_string()),
            }
            .into());
        }
        let parent = self
            .current
            .as_ref()
            .map_or_else(|| ROOT_LIST_NAME.to_string(), |open| open.name.clone());
        tracing::info!(list = %name, parent = %parent, "creating sub-list");
        self.open(name, Some(&parent)).await
    }

    /// Switches to the parent of the open list.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NoListOpen`] if nothing is open,
    /// [`WorkspaceError::AtRoot`] if the open list has no parent, or a
    /// resolution error.
    pub async fn navigate_up(&mut self) -> Result<&OpenList<P::Store, C>, WorkspaceError> {
        let name = self
            .current
            .as_ref()
            .map(|open| open.name.clone())
            .ok_or(WorkspaceError::NoListOpen)?;
        let path = self.registry.hierarchy_path(&name);
        let Some(parent) = path.iter().rev().nth(1).map(|segment| segment.name.clone()) else {
            return Err(WorkspaceError::AtRoot(name));
        };
        self.open(&parent, None).await
    }

    /// Root-first path to the open list. Empty when nothing is open.
    #[must_use]
    pub fn breadcrumb(&self) -> Vec<PathSegment> {
        self.current
            .as_ref()
            .map(|open| self.registry.hierarchy_path(&open.name))
            .unwrap_or_default()
    }

    /// Migrates the open list to `to` and reopens it from its new
    /// database.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NoListOpen`] if nothing is open, or the
    /// migration error. On error the list stays open on its old database.
    pub async fn migrate_encryption(
        &mut self,
        to: &EncryptionConfig,
    ) -> Result<MigrationReport, WorkspaceError> {
        let name = self
            .current
            .as_ref()
            .map(|open| open.name.clone())
            .ok_or(WorkspaceError::NoListOpen)?;
        let from = self
            .registry
            .find(&name)
            .map_or_else(EncryptionConfig::plaintext, |record| record.entry.encryption());
        let report = migrate::migrate(&self.registry, &name, &from, to).await?;
        self.open(&name, None).await?;
        Ok(report)
    }

    /// Migrates the open list to plaintext if it is encrypted, otherwise
    /// to the default encrypted configuration.
    ///
    /// # Errors
    ///
    /// Same as [`Self::migrate_encryption`].
    pub async fn toggle_encryption(&mut self) -> Result<MigrationReport, WorkspaceError> {
        let name = self
            .current
            .as_ref()
            .map(|open| open.name.clone())
            .ok_or(WorkspaceError::NoListOpen)?;
        let encrypted = self
            .registry
            .find(&name)
            .is_some_and(|record| record.entry.encryption_enabled);
        let to = if encrypted {
            EncryptionConfig::plaintext()
        } else {
            self.default_encryption.clone()
        };
        self.migrate_encryption(&to).await
    }

    /// Closes the open list and the registry session.
    ///
    /// # Errors
    ///
    /// Returns a registry error if the registry handle fails to close.
    pub async fn close(&mut self) -> Result<(), WorkspaceError> {
        if let Some(open) = self.current.take() {
            release(open).await;
        }
        self.registry.close().await?;
        Ok(())
    }

    async fn open(
        &mut self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<&OpenList<P::Store, C>, WorkspaceError> {
        let identity = self
            .registry
            .identity()
            .ok_or(RegistryError::IdentityNotReady)?;
        let resolved = self.registry.resolve(name, parent).await?;

        let mut service = TaskService::new(resolved.store, identity, Arc::clone(&self.gate))
            .with_max_text_len(self.max_text_len);
        if let Some(clock) = &self.clock {
            service = service.with_clock(Arc::clone(clock));
        }
        let tasks = Arc::new(service);
        tasks.refresh().await?;
        let refresh = tasks.spawn_refresh_task();

        let next = OpenList {
            name: resolved.name,
            parent: resolved.parent,
            tasks,
            refresh,
        };
        if let Some(previous) = self.current.replace(next) {
            release(previous).await;
        }
        tracing::debug!(list = %name, "switched list");
        self.current.as_ref().ok_or(WorkspaceError::NoListOpen)
    }
}

async fn release<S: LogStore, C: IdentityConfirmer>(open: OpenList<S, C>) {
    open.refresh.abort();
    if let Err(e) = open.tasks.store().close().await {
        tracing::debug!(list = %open.name, error = %e, "closing list handle failed");
    }
}
