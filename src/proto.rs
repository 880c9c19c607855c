//! Generated gRPC bindings for the candle streaming API.

pub mod candles {
    pub mod v1 {
        tonic::include_proto!("candles.v1");
    }
}
