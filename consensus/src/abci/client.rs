use super::{types::*, Application};
use crate::Error;
use std::sync::{Arc, Mutex, MutexGuard};

/// Observes every response delivered by a connection (in delivery order).
pub type Callback = Box<dyn Fn(&Request, &Response) + Send + Sync>;

/// Pairs an asynchronous request with its response.
pub struct ReqRes {
    pub request: Request,
    state: Mutex<ReqResState>,
}

#[derive(Default)]
struct ReqResState {
    response: Option<Response>,
    callback: Option<Box<dyn FnOnce(&Response) + Send>>,
}

impl ReqRes {
    fn new(request: Request) -> Self {
        Self {
            request,
            state: Mutex::new(ReqResState::default()),
        }
    }

    /// Sets a callback for the response, invoking it immediately if the response has
    /// already arrived.
    pub fn set_callback(&self, callback: impl FnOnce(&Response) + Send + 'static) {
        let mut state = lock(&self.state);
        match &state.response {
            Some(response) => {
                let response = response.clone();
                drop(state);
                callback(&response);
            }
            None => state.callback = Some(Box::new(callback)),
        }
    }

    fn complete(&self, response: Response) {
        let callback = {
            let mut state = lock(&self.state);
            state.response = Some(response.clone());
            state.callback.take()
        };
        if let Some(callback) = callback {
            callback(&response);
        }
    }

    /// The response, if it has been received.
    pub fn response(&self) -> Option<Response> {
        lock(&self.state).response.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A connection to the application.
pub trait Client: Send + Sync {
    /// Sets the callback invoked with every asynchronous response.
    fn set_response_callback(&self, callback: Callback);

    fn flush(&self) -> Result<(), Error>;
    fn info(&self, req: RequestInfo) -> Result<ResponseInfo, Error>;
    fn init_chain(&self, req: RequestInitChain) -> Result<ResponseInitChain, Error>;
    fn begin_block(&self, req: RequestBeginBlock) -> Result<ResponseBeginBlock, Error>;
    fn deliver_tx(&self, req: RequestDeliverTx) -> Result<ResponseDeliverTx, Error>;
    fn end_block(&self, req: RequestEndBlock) -> Result<ResponseEndBlock, Error>;
    fn commit(&self) -> Result<ResponseCommit, Error>;
    fn check_tx(&self, req: RequestCheckTx) -> Result<ResponseCheckTx, Error>;
    fn query(&self, req: RequestQuery) -> Result<ResponseQuery, Error>;
    fn list_snapshots(&self) -> Result<ResponseListSnapshots, Error>;
    fn offer_snapshot(&self, req: RequestOfferSnapshot) -> Result<ResponseOfferSnapshot, Error>;
    fn load_snapshot_chunk(
        &self,
        req: RequestLoadSnapshotChunk,
    ) -> Result<ResponseLoadSnapshotChunk, Error>;
    fn apply_snapshot_chunk(
        &self,
        req: RequestApplySnapshotChunk,
    ) -> Result<ResponseApplySnapshotChunk, Error>;

    fn deliver_tx_async(&self, req: RequestDeliverTx) -> Arc<ReqRes>;
    fn check_tx_async(&self, req: RequestCheckTx) -> Arc<ReqRes>;
}

/// In-process connection: every call runs under one application-wide mutex.
pub struct LocalClient<A: Application> {
    app: Arc<Mutex<A>>,
    callback: Mutex<Option<Arc<Callback>>>,
}

impl<A: Application> LocalClient<A> {
    /// Creates a connection to an application shared with other connections.
    pub fn new(app: Arc<Mutex<A>>) -> Self {
        Self {
            app,
            callback: Mutex::new(None),
        }
    }

    fn app(&self) -> Result<MutexGuard<'_, A>, Error> {
        self.app
            .lock()
            .map_err(|_| Error::Application("application mutex poisoned".into()))
    }

    fn call_async(&self, request: Request, call: impl FnOnce(&mut A) -> Response) -> Arc<ReqRes> {
        let reqres = Arc::new(ReqRes::new(request));
        let response = {
            let mut app = lock(&self.app);
            call(&mut app)
        };
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback(&reqres.request, &response);
        }
        reqres.complete(response);
        reqres
    }
}

impl<A: Application> Client for LocalClient<A> {
    fn set_response_callback(&self, callback: Callback) {
        *lock(&self.callback) = Some(Arc::new(callback));
    }

    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    fn info(&self, req: RequestInfo) -> Result<ResponseInfo, Error> {
        Ok(self.app()?.info(req))
    }

    fn init_chain(&self, req: RequestInitChain) -> Result<ResponseInitChain, Error> {
        Ok(self.app()?.init_chain(req))
    }

    fn begin_block(&self, req: RequestBeginBlock) -> Result<ResponseBeginBlock, Error> {
        Ok(self.app()?.begin_block(req))
    }

    fn deliver_tx(&self, req: RequestDeliverTx) -> Result<ResponseDeliverTx, Error> {
        Ok(self.app()?.deliver_tx(req))
    }

    fn end_block(&self, req: RequestEndBlock) -> Result<ResponseEndBlock, Error> {
        Ok(self.app()?.end_block(req))
    }

    fn commit(&self) -> Result<ResponseCommit, Error> {
        Ok(self.app()?.commit())
    }

    fn check_tx(&self, req: RequestCheckTx) -> Result<ResponseCheckTx, Error> {
        Ok(self.app()?.check_tx(req))
    }

    fn query(&self, req: RequestQuery) -> Result<ResponseQuery, Error> {
        Ok(self.app()?.query(req))
    }

    fn list_snapshots(&self) -> Result<ResponseListSnapshots, Error> {
        Ok(self.app()?.list_snapshots())
    }

    fn offer_snapshot(&self, req: RequestOfferSnapshot) -> Result<ResponseOfferSnapshot, Error> {
        Ok(self.app()?.offer_snapshot(req))
    }

    fn load_snapshot_chunk(
        &self,
        req: RequestLoadSnapshotChunk,
    ) -> Result<ResponseLoadSnapshotChunk, Error> {
        Ok(self.app()?.load_snapshot_chunk(req))
    }

    fn apply_snapshot_chunk(
        &self,
        req: RequestApplySnapshotChunk,
    ) -> Result<ResponseApplySnapshotChunk, Error> {
        Ok(self.app()?.apply_snapshot_chunk(req))
    }

    fn deliver_tx_async(&self, req: RequestDeliverTx) -> Arc<ReqRes> {
        self.call_async(Request::DeliverTx(req.clone()), |app| {
            Response::DeliverTx(app.deliver_tx(req))
        })
    }

    fn check_tx_async(&self, req: RequestCheckTx) -> Arc<ReqRes> {
        self.call_async(Request::CheckTx(req.clone()), |app| {
            Response::CheckTx(app.check_tx(req))
        })
    }
}

/// The four connections consensus keeps to the application.
#[derive(Clone)]
pub struct AppConns {
    consensus: Arc<dyn Client>,
    mempool: Arc<dyn Client>,
    query: Arc<dyn Client>,
    snapshot: Arc<dyn Client>,
}

impl AppConns {
    /// Connects to an in-process application (all connections share its mutex).
    pub fn local<A: Application>(app: A) -> Self {
        Self::local_shared(Arc::new(Mutex::new(app)))
    }

    /// Connects to an in-process application the caller keeps a handle to.
    pub fn local_shared<A: Application>(app: Arc<Mutex<A>>) -> Self {
        Self {
            consensus: Arc::new(LocalClient::new(app.clone())),
            mempool: Arc::new(LocalClient::new(app.clone())),
            query: Arc::new(LocalClient::new(app.clone())),
            snapshot: Arc::new(LocalClient::new(app)),
        }
    }

    pub fn consensus(&self) -> &Arc<dyn Client> {
        &self.consensus
    }

    pub fn mempool(&self) -> &Arc<dyn Client> {
        &self.mempool
    }

    pub fn query(&self) -> &Arc<dyn Client> {
        &self.query
    }

    pub fn snapshot(&self) -> &Arc<dyn Client> {
        &self.snapshot
    }
}
