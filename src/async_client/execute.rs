use tracing::Instrument;

use crate::core::body::SEND_CHUNK_SIZE;
use crate::core::error::Error;
use crate::core::orchestrator::{Action, Dispatch, Exchange, RequestOptions, Verdict};
use crate::core::pipeline::BodyPipeline;
use crate::core::request::RequestHead;

use super::AsyncSession;
use super::body::AsyncRequestData;
use super::response::AsyncResponse;
use super::transport::AsyncLifecycle;

impl AsyncSession {
    pub(super) async fn execute(
        &self,
        request: RequestHead,
        mut body: AsyncRequestData,
        options: RequestOptions,
    ) -> crate::Result<AsyncResponse> {
        let mut exchange = Exchange::new(self.core.clone(), request, body.shape(), options);
        let span = exchange.span().clone();
        async move {
            loop {
                let dispatch = match exchange.prepare()? {
                    Action::Cached(hit) => {
                        let pipeline = BodyPipeline::decoded(self.core.clone(), &hit.head);
                        return Ok(AsyncResponse::cached(
                            hit.head,
                            hit.history,
                            pipeline,
                            hit.body,
                        ));
                    }
                    Action::Dispatch(dispatch) => dispatch,
                };
                if dispatch.rewind
                    && let Err(error) = body.rewind_for(&dispatch.request).await
                {
                    return Err(exchange.fail(error));
                }

                let verdict = match self.attempt(&mut exchange, &dispatch, &mut body).await {
                    Ok((lifecycle, Verdict::Deliver(delivery))) => {
                        let pipeline = BodyPipeline::new(
                            self.core.clone(),
                            &delivery.head,
                            delivery.cache,
                            exchange.cancel_handle().cloned(),
                        );
                        return Ok(AsyncResponse::streaming(
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
                        if delay.is_zero() {
                            continue;
                        }
                        let canceled = match exchange.cancel_handle() {
                            Some(cancel) => cancel.sleep(delay).await,
                            None => {
                                tokio::time::sleep(delay).await;
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
                    Verdict::Fail(error) => return Err(error),
                    Verdict::Redirect | Verdict::Deliver(_) => {}
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(
        &self,
        exchange: &mut Exchange,
        dispatch: &Dispatch,
        body: &mut AsyncRequestData,
    ) -> Result<(Box<dyn AsyncLifecycle>, Verdict), Verdict> {
        let started = self
            .transport
            .start_lifecycle(&dispatch.request, &dispatch.connection);
        let connected = match exchange.cancel_handle().cloned() {
            Some(cancel) => tokio::select! {
                result = started => Some(result),
                () = cancel.canceled() => None,
            },
            None => Some(started.await),
        };
        let mut lifecycle = match connected {
            Some(Ok(lifecycle)) => lifecycle,
            Some(Err(error)) => return Err(exchange.on_error(error)),
            None => {
                let error = Error::Canceled {
                    method: dispatch.request.method().clone(),
                    uri: dispatch.request.url().to_string(),
                };
                return Err(Verdict::Fail(exchange.fail(error)));
            }
        };
        match exchange.on_connected(lifecycle.negotiated()) {
            Ok(key) => lifecycle.assign_key(key),
            Err(error) => {
                lifecycle.close();
                return Err(exchange.on_error(error));
            }
        }

        let sent = send(lifecycle.as_mut(), dispatch.send_body.then_some(body)).await;
        if let Err(error) = sent {
            lifecycle.close();
            return Err(exchange.on_error(error));
        }
        let received = match lifecycle.receive_response_headers().await {
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

async fn send(
    lifecycle: &mut dyn AsyncLifecycle,
    body: Option<&mut AsyncRequestData>,
) -> crate::Result<()> {
    if let Some(body) = body {
        loop {
            let chunk = body
                .read(SEND_CHUNK_SIZE)
                .await
                .map_err(|source| Error::BodyRead { source })?;
            if chunk.is_empty() {
                break;
            }
            lifecycle.send_request_data(chunk).await?;
        }
    }
    lifecycle.send_eof(None).await
}
