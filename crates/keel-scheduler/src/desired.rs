//! DesiredStateStore — the operator's target, persisted across restarts.

use tracing::{debug, info, warn};

use keel_state::{DesiredSpec, FrameworkIdentity, StateStore, epoch_secs};

use crate::error::{SchedulerError, SchedulerResult};

pub struct DesiredStateStore {
    store: StateStore,
    current: DesiredSpec,
}

impl DesiredStateStore {
    /// Start from the `persisted` spec, falling back to `configured` on a
    /// fresh store.
    ///
    /// A persisted spec wins over the configured one unless `apply_config`
    /// is set; a mismatch is logged so operators notice the drift.
    pub fn bootstrap(
        store: StateStore,
        persisted: Option<DesiredSpec>,
        configured: DesiredSpec,
        apply_config: bool,
    ) -> SchedulerResult<Self> {
        configured.validate().map_err(SchedulerError::InvalidSpec)?;

        let current = match persisted {
            None => {
                store.put_desired(&configured)?;
                info!(count = configured.count, "desired spec initialized from config");
                configured
            }
            Some(persisted) if !persisted.differs_from(&configured) => persisted,
            Some(persisted) if apply_config => {
                store.put_desired(&configured)?;
                info!(
                    from = persisted.count,
                    to = configured.count,
                    "desired spec replaced from config"
                );
                configured
            }
            Some(persisted) => {
                warn!(
                    persisted_count = persisted.count,
                    configured_count = configured.count,
                    "configured desired spec differs from persisted one; keeping persisted \
                     (use --apply-config to override)"
                );
                persisted
            }
        };

        Ok(Self { store, current })
    }

    pub fn get(&self) -> &DesiredSpec {
        &self.current
    }

    /// Replace the desired spec. Returns `false` when nothing changed.
    pub fn reconfigure(&mut self, mut spec: DesiredSpec) -> SchedulerResult<bool> {
        spec.validate().map_err(SchedulerError::InvalidSpec)?;
        if !spec.differs_from(&self.current) {
            debug!(count = spec.count, "desired spec unchanged");
            return Ok(false);
        }
        spec.updated_at = epoch_secs();
        self.store.put_desired(&spec)?;
        info!(from = self.current.count, to = spec.count, "desired spec updated");
        self.current = spec;
        Ok(true)
    }
}

/// Reuse the `persisted` identity, minting one on a fresh store.
pub fn load_or_create_identity(
    store: &StateStore,
    persisted: Option<FrameworkIdentity>,
    name: &str,
    mint_id: impl FnOnce() -> String,
) -> SchedulerResult<FrameworkIdentity> {
    match persisted {
        Some(identity) if identity.name == name => {
            debug!(framework_id = %identity.framework_id, "framework identity loaded");
            Ok(identity)
        }
        Some(mut identity) => {
            warn!(
                from = %identity.name,
                to = %name,
                framework_id = %identity.framework_id,
                "framework renamed; tasks minted under the old name will be treated as orphans"
            );
            identity.name = name.to_string();
            store.put_framework(&identity)?;
            Ok(identity)
        }
        None => {
            let identity = FrameworkIdentity {
                name: name.to_string(),
                framework_id: mint_id(),
                registered_at: epoch_secs(),
            };
            store.put_framework(&identity)?;
            info!(framework_id = %identity.framework_id, "framework identity created");
            Ok(identity)
        }
    }
}
