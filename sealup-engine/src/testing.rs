//! Fault injection around a [`StorageClient`] for upload engine tests

use async_trait::async_trait;
use parking_lot::Mutex;
use sealup_core::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Backend call as observed by [`FaultyStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Initiate,
    UploadPart {
        upload_id: UploadId,
        part_number: PartNumber,
    },
    Complete {
        upload_id: UploadId,
        parts: Vec<PartNumber>,
    },
    Abort {
        upload_id: UploadId,
    },
}

#[derive(Default)]
struct Faults {
    initiate: Option<BackendError>,
    // part number -> (error, remaining failures; None fails forever)
    parts: HashMap<u32, (BackendError, Option<usize>)>,
    part_delays: HashMap<u32, Duration>,
    complete: Option<BackendError>,
    complete_delay: Option<Duration>,
    abort: Option<BackendError>,
    echo_md5: Option<String>,
}

/// Wraps a backend, records every call and fails selected ones
pub struct FaultyStore<S> {
    inner: S,
    calls: Arc<Mutex<Vec<Call>>>,
    faults: Arc<Mutex<Faults>>,
}

impl<S: StorageClient> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        FaultyStore {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_initiate(&self, err: BackendError) {
        self.faults.lock().initiate = Some(err);
    }

    /// Fail every upload of `part_number`
    pub fn fail_part(&self, part_number: u32, err: BackendError) {
        self.faults.lock().parts.insert(part_number, (err, None));
    }

    /// Fail the next `times` uploads of `part_number`, then pass through
    pub fn fail_part_times(&self, part_number: u32, err: BackendError, times: usize) {
        self.faults
            .lock()
            .parts
            .insert(part_number, (err, Some(times)));
    }

    /// Hold uploads of `part_number` for `delay` before forwarding
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.faults.lock().part_delays.insert(part_number, delay);
    }

    pub fn fail_complete(&self, err: BackendError) {
        self.faults.lock().complete = Some(err);
    }

    /// Forward completions, then hold the response for `delay`
    pub fn delay_complete_response(&self, delay: Duration) {
        self.faults.lock().complete_delay = Some(delay);
    }

    pub fn fail_abort(&self, err: BackendError) {
        self.faults.lock().abort = Some(err);
    }

    /// Replace the key fingerprint the backend echoes on initiate and parts
    pub fn echo_md5(&self, md5: impl Into<String>) {
        self.faults.lock().echo_md5 = Some(md5.into());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn abort_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Abort { .. }))
    }

    pub fn complete_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Complete { .. }))
    }

    pub fn part_calls(&self, part_number: u32) -> usize {
        self.count(|c| {
            matches!(c, Call::UploadPart { part_number: n, .. } if n.get() == part_number)
        })
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn part_fault(&self, part_number: u32) -> Option<BackendError> {
        let mut faults = self.faults.lock();
        let (err, remaining) = faults.parts.get_mut(&part_number)?;
        match remaining {
            None => Some(err.clone()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(err.clone())
            }
        }
    }
}

#[async_trait]
impl<S: StorageClient> StorageClient for FaultyStore<S> {
    async fn initiate(&self, req: &InitiateRequest) -> Result<InitiateResponse> {
        self.record(Call::Initiate);

        let (fault, echo) = {
            let faults = self.faults.lock();
            (faults.initiate.clone(), faults.echo_md5.clone())
        };
        if let Some(err) = fault {
            return Err(err);
        }

        let mut resp = self.inner.initiate(req).await?;
        if echo.is_some() {
            resp.sse_key_md5 = echo;
        }
        Ok(resp)
    }

    async fn upload_part(&self, req: &UploadPartRequest) -> Result<UploadPartResponse> {
        let n = req.part_number.get();
        self.record(Call::UploadPart {
            upload_id: req.upload_id.clone(),
            part_number: req.part_number,
        });

        let delay = self.faults.lock().part_delays.get(&n).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.part_fault(n) {
            return Err(err);
        }

        let mut resp = self.inner.upload_part(req).await?;
        let echo = self.faults.lock().echo_md5.clone();
        if echo.is_some() {
            resp.sse_key_md5 = echo;
        }
        Ok(resp)
    }

    async fn complete(&self, req: &CompleteRequest) -> Result<CompleteResponse> {
        self.record(Call::Complete {
            upload_id: req.upload_id.clone(),
            parts: req.parts.iter().map(|p| p.part_number).collect(),
        });

        let (fault, delay) = {
            let faults = self.faults.lock();
            (faults.complete.clone(), faults.complete_delay)
        };
        if let Some(err) = fault {
            return Err(err);
        }

        let resp = self.inner.complete(req).await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        resp
    }

    async fn abort(&self, req: &AbortRequest) -> Result<()> {
        self.record(Call::Abort {
            upload_id: req.upload_id.clone(),
        });

        let fault = self.faults.lock().abort.clone();
        if let Some(err) = fault {
            return Err(err);
        }
        self.inner.abort(req).await
    }
}
