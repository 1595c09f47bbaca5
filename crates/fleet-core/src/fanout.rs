//! Dispatching one operation across providers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::debug;

use crate::{Error, ProviderName, ProviderRegistry, Result, Vm, VmProvider};

/// Split a heterogeneous VM list by the provider that owns each VM.
pub fn group_by_provider(vms: &[Vm]) -> BTreeMap<ProviderName, Vec<Vm>> {
    let mut groups: BTreeMap<ProviderName, Vec<Vm>> = BTreeMap::new();
    for vm in vms {
        groups.entry(vm.provider).or_default().push(vm.clone());
    }
    groups
}

impl ProviderRegistry {
    /// Run `action` against each named provider in order, one at a time.
    ///
    /// Stops at the first failure: provider `n + 1` is never touched after
    /// provider `n` failed. Inactive providers are skipped.
    pub async fn providers_sequential<F, Fut>(&self, names: &[ProviderName], action: F) -> Result<()>
    where
        F: Fn(Arc<dyn VmProvider>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut names = names.to_vec();
        names.sort();
        names.dedup();

        for name in names {
            let provider = self.require(name)?;
            if !provider.active() {
                debug!(provider = %name, "skipping inactive provider");
                continue;
            }
            action(provider.clone())
                .await
                .map_err(|e| Error::provider(name, e))?;
        }
        Ok(())
    }

    /// Run `action` against each named provider concurrently. Every provider
    /// runs to completion; all failures are combined.
    pub async fn providers_parallel<F, Fut>(&self, names: &[ProviderName], action: F) -> Result<()>
    where
        F: Fn(Arc<dyn VmProvider>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut providers = Vec::with_capacity(names.len());
        for name in names {
            providers.push(self.require(*name)?.clone());
        }

        let results = join_all(providers.into_iter().map(|p| {
            let name = p.name();
            let fut = action(p);
            async move { fut.await.map_err(|e| Error::provider(name, e)) }
        }))
        .await;

        match Error::combine(results.into_iter().filter_map(Result::err)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Group `vms` by provider and hand each group to `action`, all groups
    /// concurrently. One group failing doesn't stop the others.
    pub async fn fan_out<F, Fut>(&self, vms: &[Vm], action: F) -> Result<()>
    where
        F: Fn(Arc<dyn VmProvider>, Vec<Vm>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut units = Vec::new();
        for (name, group) in group_by_provider(vms) {
            units.push((self.require(name)?.clone(), group));
        }

        let results = join_all(units.into_iter().map(|(p, group)| {
            let name = p.name();
            let fut = action(p, group);
            async move { fut.await.map_err(|e| Error::provider(name, e)) }
        }))
        .await;

        match Error::combine(results.into_iter().filter_map(Result::err)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Every VM of every active provider. Any provider failing fails the
    /// whole listing.
    pub async fn list_all_vms(&self) -> Result<Vec<Vm>> {
        let results = join_all(self.active().map(|p| {
            let p = p.clone();
            async move { p.list().await.map_err(|e| Error::provider(p.name(), e)) }
        }))
        .await;

        let mut vms = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(list) => vms.extend(list),
                Err(e) => errors.push(e),
            }
        }
        match Error::combine(errors) {
            Some(err) => Err(err),
            None => Ok(vms),
        }
    }

    /// `(provider, account)` for every active provider that reports one.
    pub async fn find_active_accounts(&self) -> Result<Vec<(ProviderName, String)>> {
        let mut accounts = Vec::new();
        for provider in self.active() {
            let account = provider
                .find_active_account()
                .await
                .map_err(|e| Error::provider(provider.name(), e))?;
            if let Some(account) = account.filter(|a| !a.is_empty()) {
                accounts.push((provider.name(), account));
            }
        }
        Ok(accounts)
    }
}
