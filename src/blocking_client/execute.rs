use crate::core::body::SEND_CHUNK_SIZE;
use crate::core::error::Error;
use crate::core::orchestrator::{Action, Dispatch, Exchange, RequestOptions, Verdict};
use crate::core::pipeline::BodyPipeline;
use crate::core::request::RequestHead;

use super::Session;
use super::body::RequestData;
use super::response::Response;
use super::transport::Lifecycle;

impl Session {
    pub(super) fn execute(
        &self,
        request: RequestHead,
        mut body: RequestData,
        options: RequestOptions,
    ) -> crate::Result<Response> {
        let mut exchange = Exchange::new(self.core.clone(), request, body.shape(), options);
        loop {
            let dispatch = match exchange.prepare()? {
                Action::Cached(hit) => {
                    let pipeline = BodyPipeline::decoded(self.core.clone(), &hit.head);
                    return Ok(Response::cached(hit.head, hit.history, pipeline, hit.body));
                }
                Action::Dispatch(dispatch) => dispatch,
            };
            if dispatch.rewind
                && let Err(error) = body.rewind_for(&dispatch.request)
            {
                return Err(exchange.fail(error));
            }

            let verdict = match self.attempt(&mut exchange, &dispatch, &mut body) {
                Ok((lifecycle, Verdict::Deliver(delivery))) => {
                    let pipeline = BodyPipeline::new(
                        self.core.clone(),
                        &delivery.head,
                        delivery.cache,
                        exchange.cancel_handle().cloned(),
                    );
                    return Ok(Response::streaming(
                        delivery.head,
                        delivery.history,
                        pipeline,
                        lifecycle,
                    ));
                }
                Ok((mut lifecycle, verdict)) => {
                    lifecycle.close();
                    verdict
                }
                Err(verdict) => verdict,
            };

            match verdict {
                Verdict::Retry(delay) => {
                    if !delay.is_zero() {
                        let canceled = match exchange.cancel_handle() {
                            Some(cancel) => cancel.sleep_blocking(delay),
                            None => {
                                std::thread::sleep(delay);
                                false
                            }
                        };
                        if canceled {
                            let error = Error::Canceled {
                                method: dispatch.request.method().clone(),
                                uri: dispatch.request.url().to_string(),
                            };
                            return Err(exchange.fail(error));
                        }
                    }
                }
                Verdict::Fail(error) => return Err(error),
                Verdict::Redirect | Verdict::Deliver(_) => {}
            }
        }
    }

    /// Runs one attempt over a fresh lifecycle. The lifecycle is handed back
    /// only once response headers arrived; earlier failures are already
    /// judged by the exchange.
    fn attempt(
        &self,
        exchange: &mut Exchange,
        dispatch: &Dispatch,
        body: &mut RequestData,
    ) -> Result<(Box<dyn Lifecycle>, Verdict), Verdict> {
        let mut lifecycle = match self
            .transport
            .start_lifecycle(&dispatch.request, &dispatch.connection)
        {
            Ok(lifecycle) => lifecycle,
            Err(error) => return Err(exchange.on_error(error)),
        };
        match exchange.on_connected(lifecycle.negotiated()) {
            Ok(key) => lifecycle.assign_key(key),
            Err(error) => {
                lifecycle.close();
                return Err(exchange.on_error(error));
            }
        }

        if let Err(error) = send(lifecycle.as_mut(), dispatch.send_body.then_some(body)) {
            lifecycle.close();
            return Err(exchange.on_error(error));
        }
        let received = match lifecycle.receive_response_headers() {
            Ok(received) => received,
            Err(error) => {
                lifecycle.close();
                return Err(exchange.on_error(error));
            }
        };

        let verdict = exchange.on_response(received);
        if let Some(key) = exchange.take_rekey() {
            lifecycle.assign_key(key);
        }
        Ok((lifecycle, verdict))
    }
}

fn send(lifecycle: &mut dyn Lifecycle, body: Option<&mut RequestData>) -> crate::Result<()> {
    if let Some(body) = body {
        loop {
            let chunk = body
                .read(SEND_CHUNK_SIZE)
                .map_err(|source| Error::BodyRead { source })?;
            if chunk.is_empty() {
                break;
            }
            lifecycle.send_request_data(chunk)?;
        }
    }
    lifecycle.send_eof(None)
}
