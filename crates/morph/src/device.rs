//! Devices: remote runtimes, identified by the transport path that reaches them.
//!
//! Apartment proxies sharing a device share its path, so once one of them
//! learns a better route every proxy to that device uses it.

use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;

use crate::error::Result;
use crate::ids::ApartmentId;
use crate::lock;
use crate::params::InstanceFactories;
use crate::proxy::Address;
use crate::proxy::ApartmentProxy;
use crate::runtime::Runtime;
use crate::stack::LinkStack;

pub struct Device {
    path: Mutex<LinkStack>,
    proxies: DashMap<ApartmentId, Arc<ApartmentProxy>>,
}

impl Device {
    fn new(path: LinkStack) -> Self {
        Self { path: Mutex::new(path), proxies: DashMap::new() }
    }

    /// The hops from this runtime to the device, next hop on top.
    pub fn path(&self) -> LinkStack {
        lock(&self.path).clone()
    }

    pub(crate) fn set_path(&self, path: LinkStack) {
        *lock(&self.path) = path;
    }

    /// The proxy already bound to `apartment` on this device.
    pub fn find(&self, apartment: ApartmentId) -> Option<Arc<ApartmentProxy>> {
        self.proxies.get(&apartment).map(|entry| entry.clone())
    }

    /// Binds `proxy` to `apartment` unless another proxy got there first.
    pub(crate) fn register(&self, apartment: ApartmentId, proxy: &Arc<ApartmentProxy>) {
        self.proxies.entry(apartment).or_insert_with(|| proxy.clone());
    }

    pub(crate) fn deregister(&self, apartment: ApartmentId, proxy: &ApartmentProxy) {
        self.proxies.remove_if(&apartment, |_, bound| bound.id() == proxy.id());
    }

    /// The proxy for `apartment`, created on first use.
    pub(crate) fn obtain(
        self: &Arc<Self>,
        runtime: &Runtime,
        apartment: ApartmentId,
        factories: &InstanceFactories,
    ) -> Result<Arc<ApartmentProxy>> {
        if let Some(existing) = self.find(apartment) {
            return Ok(existing);
        }
        let proxy = runtime.add_proxy(self.clone(), Address::Apartment(apartment), Arc::new(factories.clone()));
        let entry = self.proxies.entry(apartment).or_insert_with(|| proxy.clone());
        let bound = entry.clone();
        drop(entry);
        if bound.id() != proxy.id() {
            proxy.discard();
        }
        Ok(bound)
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("path", &*lock(&self.path)).field("proxies", &self.proxies.len()).finish()
    }
}

/// Every device this runtime knows about.
#[derive(Default)]
pub struct Devices {
    list: Mutex<Vec<Arc<Device>>>,
}

impl Devices {
    pub fn find(&self, path: &LinkStack) -> Result<Option<Arc<Device>>> {
        let links = path.to_links()?;
        let list = lock(&self.list);
        for device in list.iter() {
            if device.path().to_links()? == links {
                return Ok(Some(device.clone()));
            }
        }
        Ok(None)
    }

    /// The device at `path`, created on first use.
    pub fn obtain(&self, path: LinkStack) -> Result<Arc<Device>> {
        let links = path.to_links()?;
        let mut list = lock(&self.list);
        for device in list.iter() {
            if device.path().to_links()? == links {
                return Ok(device.clone());
            }
        }
        tracing::debug!(%path, "new device");
        let device = Arc::new(Device::new(path));
        list.push(device.clone());
        Ok(device)
    }

    pub fn len(&self) -> usize {
        lock(&self.list).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;

    #[test]
    fn test_devices_are_shared_by_path() {
        let devices = Devices::default();
        let path = LinkStack::from_links(vec![Link::internet("10.0.0.2:12288".parse().unwrap())]);
        let first = devices.obtain(path.clone()).unwrap();
        let second = devices.obtain(path.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(devices.len(), 1);

        let other = LinkStack::from_links(vec![Link::internet("10.0.0.3:12288".parse().unwrap())]);
        assert!(devices.find(&other).unwrap().is_none());
        devices.obtain(other).unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.find(&path).unwrap().is_some());
    }
}
