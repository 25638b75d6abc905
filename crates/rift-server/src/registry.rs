//! Server-wide proxy registry.
//!
//! Owns proxy names, public ports, vhost domains and load-balancing groups.
//! Registration checks and endpoint binding happen under one mutex, so two
//! racing requests for the same name or port see a consistent table and the
//! loser changes nothing.

use crate::broker::TransformFlags;
use crate::config::ServerConfig;
use crate::control::ControlHandle;
use crate::ports::PortAllocator;
use rift_core::messages::NewProxy;
use rift_core::{ProxyType, RiftError, RiftResult};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Everything the data path needs to reach a proxy's client.
#[derive(Clone)]
pub struct ProxyRoute {
    pub name: String,
    pub proxy_type: ProxyType,
    pub sk: String,
    pub transform: TransformFlags,
    pub control: Arc<ControlHandle>,
}

/// Which registration an accepted user connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Proxy(String),
    Group(String),
}

#[derive(Debug)]
pub enum ListenerKind {
    Tcp(std::net::TcpListener),
    Udp(std::net::UdpSocket),
}

/// A freshly bound public endpoint, plus its stop signal.
///
/// The sender half lives in the registry; removing the registration stops the listener.
#[derive(Debug)]
pub struct ProxyListener {
    pub kind: ListenerKind,
    pub target: ListenTarget,
    pub cancel_rx: mpsc::Receiver<()>,
}

/// Result of a successful registration.
#[derive(Debug)]
pub struct Admission {
    pub proxy_type: ProxyType,
    pub remote_addr: String,
    pub domains: Vec<String>,
    /// Present when the caller must start serving a new public endpoint.
    pub listener: Option<ProxyListener>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    None,
    TcpPort(u16),
    UdpPort(u16),
    Group(String),
    Domains(Vec<String>),
}

struct ProxyEntry {
    route: ProxyRoute,
    session_id: u64,
    endpoint: Endpoint,
    _cancel: Option<mpsc::Sender<()>>,
}

struct TcpGroup {
    key: String,
    port: u16,
    members: Vec<String>,
    next: usize,
    _cancel: mpsc::Sender<()>,
}

#[derive(Default)]
struct RegistryState {
    proxies: HashMap<String, ProxyEntry>,
    tcp_ports: PortAllocator,
    udp_ports: PortAllocator,
    domains: HashMap<(ProxyType, String), String>,
    groups: HashMap<String, TcpGroup>,
}

pub struct ProxyRegistry {
    bind_addr: String,
    vhost_http_port: Option<u16>,
    vhost_https_port: Option<u16>,
    subdomain_host: String,
    state: Mutex<RegistryState>,
}

/// Bind a port: the requested one, or the first free allowed one, or an OS pick.
fn allocate<T>(
    alloc: &mut PortAllocator,
    requested: u16,
    bind: impl Fn(u16) -> io::Result<T>,
    port_of: impl Fn(&T) -> io::Result<u16>,
) -> RiftResult<(T, u16)> {
    if requested != 0 {
        alloc.check(requested)?;
        let bound = bind(requested).map_err(|e| {
            RiftError::EndpointUnavailable(format!("port {requested} unavailable: {e}"))
        })?;
        alloc.mark_used(requested);
        return Ok((bound, requested));
    }

    let found = match alloc.candidates() {
        Some(mut ports) => ports.find_map(|p| bind(p).ok().map(|b| (b, p))),
        None => bind(0)
            .ok()
            .and_then(|b| port_of(&b).ok().map(|p| (b, p))),
    };
    let (bound, port) = found.ok_or_else(|| {
        RiftError::EndpointUnavailable("no free port in the allowed range".into())
    })?;
    alloc.mark_used(port);
    Ok((bound, port))
}

impl ProxyRegistry {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            bind_addr: config.proxy_bind_addr.clone(),
            vhost_http_port: config.vhost_http_port,
            vhost_https_port: config.vhost_https_port,
            subdomain_host: config.subdomain_host.clone(),
            state: Mutex::new(RegistryState {
                tcp_ports: PortAllocator::new(config.allow_ports.clone()),
                udp_ports: PortAllocator::new(config.allow_ports.clone()),
                ..Default::default()
            }),
        }
    }

    fn bind_tcp(&self, port: u16) -> io::Result<std::net::TcpListener> {
        let listener = std::net::TcpListener::bind((self.bind_addr.as_str(), port))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    fn bind_udp(&self, port: u16) -> io::Result<std::net::UdpSocket> {
        let socket = std::net::UdpSocket::bind((self.bind_addr.as_str(), port))?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Register a proxy for `control`, allocating its public endpoint.
    pub async fn register(
        &self,
        control: &Arc<ControlHandle>,
        req: &NewProxy,
    ) -> RiftResult<Admission> {
        let proxy_type: ProxyType = req
            .proxy_type
            .parse()
            .map_err(RiftError::UnsupportedProxyType)?;
        if req.proxy_name.is_empty() {
            return Err(RiftError::Other("proxy name must not be empty".into()));
        }

        let mut st = self.state.lock().await;
        if st.proxies.contains_key(&req.proxy_name) {
            return Err(RiftError::NameConflict(req.proxy_name.clone()));
        }

        let mut remote_addr = String::new();
        let mut domains = Vec::new();
        let mut listener = None;
        let mut entry_cancel = None;

        let endpoint = match proxy_type {
            ProxyType::Tcp if !req.group.is_empty() => {
                let (port, created) = self.join_group(&mut st, req)?;
                remote_addr = format!(":{port}");
                if let Some((l, cancel_rx)) = created {
                    listener = Some(ProxyListener {
                        kind: ListenerKind::Tcp(l),
                        target: ListenTarget::Group(req.group.clone()),
                        cancel_rx,
                    });
                }
                Endpoint::Group(req.group.clone())
            }
            ProxyType::Tcp => {
                let (l, port) = allocate(
                    &mut st.tcp_ports,
                    req.remote_port,
                    |p| self.bind_tcp(p),
                    |l| l.local_addr().map(|a| a.port()),
                )?;
                let (tx, rx) = mpsc::channel(1);
                entry_cancel = Some(tx);
                listener = Some(ProxyListener {
                    kind: ListenerKind::Tcp(l),
                    target: ListenTarget::Proxy(req.proxy_name.clone()),
                    cancel_rx: rx,
                });
                remote_addr = format!(":{port}");
                Endpoint::TcpPort(port)
            }
            ProxyType::Udp => {
                let (s, port) = allocate(
                    &mut st.udp_ports,
                    req.remote_port,
                    |p| self.bind_udp(p),
                    |s| s.local_addr().map(|a| a.port()),
                )?;
                let (tx, rx) = mpsc::channel(1);
                entry_cancel = Some(tx);
                listener = Some(ProxyListener {
                    kind: ListenerKind::Udp(s),
                    target: ListenTarget::Proxy(req.proxy_name.clone()),
                    cancel_rx: rx,
                });
                remote_addr = format!(":{port}");
                Endpoint::UdpPort(port)
            }
            ProxyType::Http | ProxyType::Https => {
                let (addr, claimed) = self.claim_domains(&mut st, proxy_type, req)?;
                remote_addr = addr;
                domains = claimed.clone();
                Endpoint::Domains(claimed)
            }
            ProxyType::Stcp | ProxyType::Xtcp => Endpoint::None,
            ProxyType::TcpMux => {
                return Err(RiftError::UnsupportedProxyType(proxy_type.to_string()));
            }
        };

        let route = ProxyRoute {
            name: req.proxy_name.clone(),
            proxy_type,
            sk: req.sk.clone(),
            transform: TransformFlags {
                use_encryption: req.use_encryption,
                use_compression: req.use_compression,
            },
            control: control.clone(),
        };
        st.proxies.insert(
            req.proxy_name.clone(),
            ProxyEntry {
                route,
                session_id: control.session_id,
                endpoint,
                _cancel: entry_cancel,
            },
        );

        Ok(Admission {
            proxy_type,
            remote_addr,
            domains,
            listener,
        })
    }

    /// Join or create a tcp load-balancing group. Returns the group port and,
    /// for a new group, its listener.
    #[allow(clippy::type_complexity)]
    fn join_group(
        &self,
        st: &mut RegistryState,
        req: &NewProxy,
    ) -> RiftResult<(u16, Option<(std::net::TcpListener, mpsc::Receiver<()>)>)> {
        if let Some(group) = st.groups.get_mut(&req.group) {
            if group.key != req.group_key {
                return Err(RiftError::EndpointUnavailable(format!(
                    "group [{}] key mismatch",
                    req.group
                )));
            }
            if req.remote_port != 0 && req.remote_port != group.port {
                return Err(RiftError::EndpointUnavailable(format!(
                    "group [{}] listens on port {}, not {}",
                    req.group, group.port, req.remote_port
                )));
            }
            group.members.push(req.proxy_name.clone());
            return Ok((group.port, None));
        }

        let (l, port) = allocate(
            &mut st.tcp_ports,
            req.remote_port,
            |p| self.bind_tcp(p),
            |l| l.local_addr().map(|a| a.port()),
        )?;
        let (tx, rx) = mpsc::channel(1);
        st.groups.insert(
            req.group.clone(),
            TcpGroup {
                key: req.group_key.clone(),
                port,
                members: vec![req.proxy_name.clone()],
                next: 0,
                _cancel: tx,
            },
        );
        Ok((port, Some((l, rx))))
    }

    fn claim_domains(
        &self,
        st: &mut RegistryState,
        proxy_type: ProxyType,
        req: &NewProxy,
    ) -> RiftResult<(String, Vec<String>)> {
        let (vhost_port, scheme, default_port) = match proxy_type {
            ProxyType::Http => (self.vhost_http_port, "http", 80),
            _ => (self.vhost_https_port, "https", 443),
        };
        let vhost_port = vhost_port.ok_or_else(|| {
            RiftError::EndpointUnavailable(format!("vhost {scheme} port is not configured"))
        })?;

        let mut domains: Vec<String> = req
            .custom_domains
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        if !req.subdomain.is_empty() {
            if self.subdomain_host.is_empty() {
                return Err(RiftError::EndpointUnavailable(
                    "subdomains are not enabled on this server".into(),
                ));
            }
            if req.subdomain.contains('.') || req.subdomain.contains('*') {
                return Err(RiftError::EndpointUnavailable(format!(
                    "invalid subdomain [{}]",
                    req.subdomain
                )));
            }
            domains.push(format!(
                "{}.{}",
                req.subdomain.to_ascii_lowercase(),
                self.subdomain_host
            ));
        }
        domains.sort();
        domains.dedup();
        if domains.is_empty() {
            return Err(RiftError::EndpointUnavailable(
                "custom_domains and subdomain are both empty".into(),
            ));
        }
        if let Some(taken) = domains
            .iter()
            .find(|d| st.domains.contains_key(&(proxy_type, (*d).clone())))
        {
            return Err(RiftError::EndpointUnavailable(format!(
                "domain [{taken}] is already in use"
            )));
        }
        for d in &domains {
            st.domains
                .insert((proxy_type, d.clone()), req.proxy_name.clone());
        }

        let suffix = if vhost_port == default_port {
            String::new()
        } else {
            format!(":{vhost_port}")
        };
        let remote_addr = domains
            .iter()
            .map(|d| format!("{scheme}://{d}{suffix}"))
            .collect::<Vec<_>>()
            .join(",");
        Ok((remote_addr, domains))
    }

    fn release(st: &mut RegistryState, name: &str, entry: ProxyEntry) {
        match entry.endpoint {
            Endpoint::None => {}
            Endpoint::TcpPort(p) => st.tcp_ports.release(p),
            Endpoint::UdpPort(p) => st.udp_ports.release(p),
            Endpoint::Group(g) => {
                let emptied = match st.groups.get_mut(&g) {
                    Some(group) => {
                        group.members.retain(|m| m != name);
                        group.members.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    if let Some(group) = st.groups.remove(&g) {
                        st.tcp_ports.release(group.port);
                        debug!(group = %g, port = group.port, "tcp group released");
                    }
                }
            }
            Endpoint::Domains(domains) => {
                let proxy_type = entry.route.proxy_type;
                for d in domains {
                    st.domains.remove(&(proxy_type, d));
                }
            }
        }
    }

    /// Remove a proxy owned by `session_id`. Returns its type if it existed.
    pub async fn unregister(&self, session_id: u64, name: &str) -> Option<ProxyType> {
        let mut st = self.state.lock().await;
        match st.proxies.get(name) {
            Some(e) if e.session_id == session_id => {}
            _ => return None,
        }
        let entry = st.proxies.remove(name)?;
        let proxy_type = entry.route.proxy_type;
        Self::release(&mut st, name, entry);
        Some(proxy_type)
    }

    /// Remove every proxy owned by a session. Returns the removed names.
    pub async fn unregister_session(&self, session_id: u64) -> Vec<String> {
        let mut st = self.state.lock().await;
        let names: Vec<String> = st
            .proxies
            .iter()
            .filter(|(_, e)| e.session_id == session_id)
            .map(|(n, _)| n.clone())
            .collect();
        for name in &names {
            if let Some(entry) = st.proxies.remove(name) {
                Self::release(&mut st, name, entry);
            }
        }
        names
    }

    pub async fn lookup(&self, name: &str) -> Option<ProxyRoute> {
        self.state
            .lock()
            .await
            .proxies
            .get(name)
            .map(|e| e.route.clone())
    }

    /// Pick the next member of a tcp group, round robin.
    pub async fn pick_group_member(&self, group: &str) -> Option<ProxyRoute> {
        let mut st = self.state.lock().await;
        let st = &mut *st;
        let g = st.groups.get_mut(group)?;
        for _ in 0..g.members.len() {
            let idx = g.next % g.members.len();
            g.next = g.next.wrapping_add(1);
            if let Some(entry) = st.proxies.get(&g.members[idx]) {
                return Some(entry.route.clone());
            }
        }
        None
    }

    /// Resolve the route for a listener target.
    pub async fn resolve(&self, target: &ListenTarget) -> Option<ProxyRoute> {
        match target {
            ListenTarget::Proxy(name) => self.lookup(name).await,
            ListenTarget::Group(group) => self.pick_group_member(group).await,
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.lock().await.proxies.contains_key(name)
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.proxies.len()
    }

    pub async fn ports_in_use(&self) -> usize {
        let st = self.state.lock().await;
        st.tcp_ports.in_use() + st.udp_ports.in_use()
    }
}
