//! gRPC plumbing for the `p4.v1.P4Runtime` service.
//!
//! Hand-written equivalents of what tonic codegen would emit, so the crate
//! needs no protoc at build time. [`P4RuntimeServer`] dispatches HTTP/2
//! requests by path onto a [`P4Runtime`] implementation; [`P4RuntimeClient`]
//! is the matching client used by sessions and tests.

use super::proto;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_stream::Stream;
use tonic::codegen::{http, Body, BoxFuture, StdError};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status, Streaming};

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "p4.v1.P4Runtime";

/// Boxed response stream for server-streaming and bidirectional methods.
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

/// Server-side P4Runtime API.
#[tonic::async_trait]
pub trait P4Runtime: Send + Sync + 'static {
    /// Apply a batch of updates.
    async fn write(
        &self,
        request: Request<proto::WriteRequest>,
    ) -> Result<Response<proto::WriteResponse>, Status>;

    /// Read entities back.
    async fn read(
        &self,
        request: Request<proto::ReadRequest>,
    ) -> Result<Response<ResponseStream<proto::ReadResponse>>, Status>;

    /// Install or verify a forwarding pipeline.
    async fn set_forwarding_pipeline_config(
        &self,
        request: Request<proto::SetForwardingPipelineConfigRequest>,
    ) -> Result<Response<proto::SetForwardingPipelineConfigResponse>, Status>;

    /// Return the installed forwarding pipeline.
    async fn get_forwarding_pipeline_config(
        &self,
        request: Request<proto::GetForwardingPipelineConfigRequest>,
    ) -> Result<Response<proto::GetForwardingPipelineConfigResponse>, Status>;

    /// Report the supported API version.
    async fn capabilities(
        &self,
        request: Request<proto::CapabilitiesRequest>,
    ) -> Result<Response<proto::CapabilitiesResponse>, Status>;

    /// Arbitration and packet I/O stream.
    async fn stream_channel(
        &self,
        request: Request<Streaming<proto::StreamMessageRequest>>,
    ) -> Result<Response<ResponseStream<proto::StreamMessageResponse>>, Status>;
}

// ============================================================================
// Server
// ============================================================================

/// Tower service exposing a [`P4Runtime`] implementation.
pub struct P4RuntimeServer<T: P4Runtime> {
    inner: Arc<T>,
}

impl<T: P4Runtime> P4RuntimeServer<T> {
    /// Wrap an implementation.
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    /// Wrap a shared implementation.
    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T: P4Runtime> Clone for P4RuntimeServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: P4Runtime> tonic::server::NamedService for P4RuntimeServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}

struct WriteSvc<T: P4Runtime>(Arc<T>);

impl<T: P4Runtime> tonic::server::UnaryService<proto::WriteRequest> for WriteSvc<T> {
    type Response = proto::WriteResponse;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<proto::WriteRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.write(request).await })
    }
}

struct ReadSvc<T: P4Runtime>(Arc<T>);

impl<T: P4Runtime> tonic::server::ServerStreamingService<proto::ReadRequest> for ReadSvc<T> {
    type Response = proto::ReadResponse;
    type ResponseStream = ResponseStream<proto::ReadResponse>;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<proto::ReadRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.read(request).await })
    }
}

struct SetPipelineSvc<T: P4Runtime>(Arc<T>);

impl<T: P4Runtime> tonic::server::UnaryService<proto::SetForwardingPipelineConfigRequest>
    for SetPipelineSvc<T>
{
    type Response = proto::SetForwardingPipelineConfigResponse;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<proto::SetForwardingPipelineConfigRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.set_forwarding_pipeline_config(request).await })
    }
}

struct GetPipelineSvc<T: P4Runtime>(Arc<T>);

impl<T: P4Runtime> tonic::server::UnaryService<proto::GetForwardingPipelineConfigRequest>
    for GetPipelineSvc<T>
{
    type Response = proto::GetForwardingPipelineConfigResponse;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<proto::GetForwardingPipelineConfigRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.get_forwarding_pipeline_config(request).await })
    }
}

struct CapabilitiesSvc<T: P4Runtime>(Arc<T>);

impl<T: P4Runtime> tonic::server::UnaryService<proto::CapabilitiesRequest> for CapabilitiesSvc<T> {
    type Response = proto::CapabilitiesResponse;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<proto::CapabilitiesRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.capabilities(request).await })
    }
}

struct StreamChannelSvc<T: P4Runtime>(Arc<T>);

impl<T: P4Runtime> tonic::server::StreamingService<proto::StreamMessageRequest>
    for StreamChannelSvc<T>
{
    type Response = proto::StreamMessageResponse;
    type ResponseStream = ResponseStream<proto::StreamMessageResponse>;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<proto::StreamMessageRequest>>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.stream_channel(request).await })
    }
}

impl<T, B> tonic::codegen::Service<http::Request<B>> for P4RuntimeServer<T>
where
    T: P4Runtime,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        let path = req.uri().path().to_string();
        tracing::trace!(path = %path, "P4Runtime call");

        match path.as_str() {
            "/p4.v1.P4Runtime/Write" => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(WriteSvc(inner), req).await)
            }),
            "/p4.v1.P4Runtime/Read" => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.server_streaming(ReadSvc(inner), req).await)
            }),
            "/p4.v1.P4Runtime/SetForwardingPipelineConfig" => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(SetPipelineSvc(inner), req).await)
            }),
            "/p4.v1.P4Runtime/GetForwardingPipelineConfig" => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(GetPipelineSvc(inner), req).await)
            }),
            "/p4.v1.P4Runtime/Capabilities" => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(CapabilitiesSvc(inner), req).await)
            }),
            "/p4.v1.P4Runtime/StreamChannel" => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.streaming(StreamChannelSvc(inner), req).await)
            }),
            _ => Box::pin(async move {
                tracing::warn!(path = %path, "unknown P4Runtime method");
                Ok(Status::unimplemented(format!("Unknown method: {}", path)).into_http())
            }),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// P4Runtime client over a tonic channel.
#[derive(Debug, Clone)]
pub struct P4RuntimeClient {
    inner: tonic::client::Grpc<Channel>,
}

impl P4RuntimeClient {
    /// Connect to `addr` (host:port) over plaintext HTTP/2.
    pub async fn connect(addr: impl std::fmt::Display) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(format!("http://{}", addr))?
            .connect()
            .await?;
        Ok(Self::new(channel))
    }

    /// Client over an existing channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    async fn ready(&mut self) -> Result<(), Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("Service was not ready: {}", e)))
    }

    pub async fn write(
        &mut self,
        request: impl tonic::IntoRequest<proto::WriteRequest>,
    ) -> Result<Response<proto::WriteResponse>, Status> {
        self.ready().await?;
        let path = http::uri::PathAndQuery::from_static("/p4.v1.P4Runtime/Write");
        self.inner
            .unary(request.into_request(), path, tonic::codec::ProstCodec::default())
            .await
    }

    pub async fn read(
        &mut self,
        request: impl tonic::IntoRequest<proto::ReadRequest>,
    ) -> Result<Response<Streaming<proto::ReadResponse>>, Status> {
        self.ready().await?;
        let path = http::uri::PathAndQuery::from_static("/p4.v1.P4Runtime/Read");
        self.inner
            .server_streaming(request.into_request(), path, tonic::codec::ProstCodec::default())
            .await
    }

    pub async fn set_forwarding_pipeline_config(
        &mut self,
        request: impl tonic::IntoRequest<proto::SetForwardingPipelineConfigRequest>,
    ) -> Result<Response<proto::SetForwardingPipelineConfigResponse>, Status> {
        self.ready().await?;
        let path =
            http::uri::PathAndQuery::from_static("/p4.v1.P4Runtime/SetForwardingPipelineConfig");
        self.inner
            .unary(request.into_request(), path, tonic::codec::ProstCodec::default())
            .await
    }

    pub async fn get_forwarding_pipeline_config(
        &mut self,
        request: impl tonic::IntoRequest<proto::GetForwardingPipelineConfigRequest>,
    ) -> Result<Response<proto::GetForwardingPipelineConfigResponse>, Status> {
        self.ready().await?;
        let path =
            http::uri::PathAndQuery::from_static("/p4.v1.P4Runtime/GetForwardingPipelineConfig");
        self.inner
            .unary(request.into_request(), path, tonic::codec::ProstCodec::default())
            .await
    }

    pub async fn capabilities(
        &mut self,
        request: impl tonic::IntoRequest<proto::CapabilitiesRequest>,
    ) -> Result<Response<proto::CapabilitiesResponse>, Status> {
        self.ready().await?;
        let path = http::uri::PathAndQuery::from_static("/p4.v1.P4Runtime/Capabilities");
        self.inner
            .unary(request.into_request(), path, tonic::codec::ProstCodec::default())
            .await
    }

    pub async fn stream_channel(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = proto::StreamMessageRequest>,
    ) -> Result<Response<Streaming<proto::StreamMessageResponse>>, Status> {
        self.ready().await?;
        let path = http::uri::PathAndQuery::from_static("/p4.v1.P4Runtime/StreamChannel");
        self.inner
            .streaming(
                request.into_streaming_request(),
                path,
                tonic::codec::ProstCodec::default(),
            )
            .await
    }
}
