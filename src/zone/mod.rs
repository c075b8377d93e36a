pub(crate) mod bitmap;
pub(crate) mod cache;
pub(crate) mod chunk;
pub(crate) mod grow;
pub(crate) mod integration;
pub(crate) mod magazine;
pub(crate) mod provider;
pub(crate) mod reclaim;
pub(crate) mod registry;
pub(crate) mod stats;
pub(crate) mod wss;
#[allow(clippy::module_inception)]
pub(crate) mod zone;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
