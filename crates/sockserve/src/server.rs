//! Socket server orchestrator
//!
//! `SocketServer` ties the pieces together:
//!
//! 1. validate the configuration and the handler
//! 2. start a `ThreadPool` (unless the pool size is 0)
//! 3. open the listener in the chosen mode:
//!    - `AcceptLoop`: blocking `accept()`, one pool job per connection
//!    - `KernelEvents`: a `KernelEventServer` whose readable events become
//!      pool jobs
//! 4. serve on the calling thread
//!
//! The mode is fixed by `init()`. If kernel events are requested but the
//! platform has no backend (or it cannot be created), the server logs a
//! warning and uses the accept loop instead.

use crate::config::{ServerConfig, ServerMode};
use crate::handler::{run_inline, serve_connection, PooledService, RequestHandler};
use log::{error, info, warn};
use sockserve_core::error::{ServerError, ServerResult};
use sockserve_core::factory::ThreadingFactory;
use sockserve_core::logging;
use sockserve_core::runnable::WorkItem;
use sockserve_runtime::{
    kernel_events_supported, setup_listener, KernelEventServer, PlatformKernelEvents, PlatformThreadingFactory,
    Socket, SocketOptions, ThreadPool,
};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

/// Pause after an accept error that is not a signal interruption
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

enum Listening<F: ThreadingFactory> {
    AcceptLoop(TcpListener),
    KernelEvents(KernelEventServer<F, PlatformKernelEvents>),
}

/// TCP server running a `RequestHandler`
pub struct SocketServer<F: ThreadingFactory = PlatformThreadingFactory> {
    config: ServerConfig,
    factory: Arc<F>,
    handler: Option<Arc<dyn RequestHandler>>,
    pool: Option<ThreadPool<F>>,
    listening: Option<Listening<F>>,
}

impl<F: ThreadingFactory> SocketServer<F> {
    pub fn new(config: ServerConfig, factory: Arc<F>) -> Self {
        Self {
            config,
            factory,
            handler: None,
            pool: None,
            listening: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn set_handler(&mut self, handler: Arc<dyn RequestHandler>) {
        self.handler = Some(handler);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.listening.is_some()
    }

    /// Mode in effect after `init()`, `None` before
    pub fn mode(&self) -> Option<ServerMode> {
        self.listening.as_ref().map(|l| match l {
            Listening::AcceptLoop(_) => ServerMode::AcceptLoop,
            Listening::KernelEvents(_) => ServerMode::KernelEvents,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.listening.as_ref()? {
            Listening::AcceptLoop(listener) => listener.local_addr().ok(),
            Listening::KernelEvents(server) => server.local_addr().ok(),
        }
    }

    /// Pool workers, 0 when handlers run inline
    pub fn num_workers(&self) -> usize {
        self.pool.as_ref().map_or(0, ThreadPool::num_workers)
    }

    /// Validate, start the pool and open the listener. Idempotent once it
    /// has succeeded.
    pub fn init(&mut self) -> ServerResult<()> {
        if self.listening.is_some() {
            return Ok(());
        }

        let handler = self
            .handler
            .clone()
            .ok_or_else(|| ServerError::Config("no request handler configured".into()))?;
        self.config.validate()?;
        logging::set_log_level(self.config.log_level);

        if self.pool.is_none() && self.config.thread_pool_size > 0 {
            let mut pool = ThreadPool::new(Arc::clone(&self.factory), self.config.thread_pool_size, "sockserve")?;
            pool.start()?;
            self.pool = Some(pool);
        }

        let addr = self.config.listen_addr();
        let listening = match self.config.server_mode {
            ServerMode::KernelEvents => {
                let opened = self.open_kernel_events(addr, handler);
                self.kernel_events_or_accept_loop(addr, opened)?
            }
            ServerMode::AcceptLoop => Listening::AcceptLoop(setup_listener(addr, self.config.max_connections)?),
        };
        self.listening = Some(listening);

        info!(
            "sockserve initialized: {} on {} ({} workers, {})",
            self.mode().map(|m| m.to_string()).unwrap_or_default(),
            self.local_addr().map(|a| a.to_string()).unwrap_or_else(|| addr.to_string()),
            self.num_workers(),
            self.factory.backend_name()
        );
        Ok(())
    }

    /// Use the readiness server if it opened; an unavailable backend
    /// downgrades to the accept loop, any other error is fatal
    fn kernel_events_or_accept_loop(
        &self,
        addr: SocketAddr,
        opened: ServerResult<KernelEventServer<F, PlatformKernelEvents>>,
    ) -> ServerResult<Listening<F>> {
        match opened {
            Ok(server) => Ok(Listening::KernelEvents(server)),
            Err(ServerError::KernelEventsUnavailable) => {
                warn!("kernel events unavailable, falling back to accept loop");
                Ok(Listening::AcceptLoop(setup_listener(addr, self.config.max_connections)?))
            }
            Err(e) => Err(e),
        }
    }

    fn open_kernel_events(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn RequestHandler>,
    ) -> ServerResult<KernelEventServer<F, PlatformKernelEvents>> {
        if !kernel_events_supported() {
            return Err(ServerError::KernelEventsUnavailable);
        }
        let backend = PlatformKernelEvents::new().map_err(|e| {
            warn!("kernel event backend creation failed: {}", e);
            ServerError::KernelEventsUnavailable
        })?;

        let service = PooledService::new(handler, self.pool.as_ref().map(ThreadPool::handle));
        KernelEventServer::bind(
            &*self.factory,
            backend,
            addr,
            self.config.max_connections,
            Arc::new(service),
            self.config.socket_options(),
            self.config.event_capacity,
        )
    }

    /// Serve on the calling thread until a fatal error
    pub fn serve(&self) -> ServerResult<()> {
        let handler = self.handler.as_ref().ok_or(ServerError::NotInitialized)?;
        match self.listening.as_ref().ok_or(ServerError::NotInitialized)? {
            Listening::KernelEvents(server) => server.run(),
            Listening::AcceptLoop(listener) => {
                self.accept_loop(listener, handler, &self.config.socket_options());
                Ok(())
            }
        }
    }

    /// Initialize if needed and serve. Returns the process exit code: 1 if
    /// the server could not start or failed while serving.
    pub fn run(&mut self) -> i32 {
        if let Err(e) = self.init() {
            error!("critical: server startup failed: {}", e);
            return 1;
        }
        match self.serve() {
            Ok(()) => 0,
            Err(e) => {
                error!("critical: server stopped: {}", e);
                1
            }
        }
    }

    fn accept_loop(&self, listener: &TcpListener, handler: &Arc<dyn RequestHandler>, options: &SocketOptions) {
        info!("accept loop on {}", listener.local_addr().map(|a| a.to_string()).unwrap_or_default());
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    std::thread::sleep(ACCEPT_ERROR_BACKOFF);
                    continue;
                }
            };

            let socket = Socket::from_stream(stream);
            if let Err(e) = options.apply(&socket) {
                warn!("{}: socket options not applied: {}", peer, e);
            }

            let handler = Arc::clone(handler);
            let item = WorkItem::from_fn(move || serve_connection(&*handler, socket));
            match &self.pool {
                Some(pool) => {
                    if let Err(rejected) = pool.add_request(item) {
                        warn!("{}: dropping connection, {}", peer, rejected);
                    }
                }
                None => run_inline(item),
            }
        }
    }

    /// Stop the pool after draining queued work. The listener stays open
    /// until the server is dropped.
    pub fn shutdown(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct Silent;

    impl RequestHandler for Silent {
        fn handle_request(&self, _socket: &mut Socket) -> bool {
            false
        }
    }

    fn factory() -> Arc<PlatformThreadingFactory> {
        Arc::new(PlatformThreadingFactory::new())
    }

    #[test]
    fn test_missing_handler_exits_1() {
        let mut server = SocketServer::new(ServerConfig::new(), factory());
        assert_eq!(server.run(), 1);
        assert!(!server.is_initialized());
    }

    #[test]
    fn test_invalid_port_exits_1() {
        let mut server = SocketServer::new(ServerConfig::new().port(0), factory()).with_handler(Arc::new(Silent));
        assert_eq!(server.run(), 1);
    }

    #[test]
    fn test_invalid_backlog_rejected() {
        let mut server =
            SocketServer::new(ServerConfig::new().max_connections(0), factory()).with_handler(Arc::new(Silent));
        assert!(matches!(server.init(), Err(ServerError::Config(_))));
        assert_eq!(server.mode(), None);
    }

    #[test]
    fn test_serve_before_init() {
        let server = SocketServer::new(ServerConfig::new(), factory()).with_handler(Arc::new(Silent));
        assert!(matches!(server.serve(), Err(ServerError::NotInitialized)));
    }

    #[test]
    fn test_unavailable_kernel_events_fall_back_to_accept_loop() {
        let config = ServerConfig::new()
            .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port())
            .server_mode(ServerMode::KernelEvents);
        let mut server = SocketServer::new(config, factory()).with_handler(Arc::new(Silent));

        let addr = server.config().listen_addr();
        let listening = server
            .kernel_events_or_accept_loop(addr, Err(ServerError::KernelEventsUnavailable))
            .unwrap();
        server.listening = Some(listening);
        assert_eq!(server.mode(), Some(ServerMode::AcceptLoop));
        assert_eq!(server.local_addr(), Some(addr));

        // Only an unavailable backend downgrades
        let err = server.kernel_events_or_accept_loop(addr, Err(ServerError::NotInitialized));
        assert!(matches!(err, Err(ServerError::NotInitialized)));
    }
}
