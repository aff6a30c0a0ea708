use bytes::Bytes;

// MARK: - DecodeUnit

/// One encoded video/audio unit handed to the decoder layer.
#[derive(Debug, Clone)]
pub struct DecodeUnit {
    pub data: Bytes,
    pub flags: u32,
    /// Milliseconds timestamp captured when the unit arrived off the wire.
    pub receive_timestamp_ms: u64,
}

// MARK: - DecodeUnitSink

/// Consumer of decode units produced by an established session.
///
/// Decoders are external collaborators: the session engine only delivers
/// units and expects the sink to free them after consumption. Implementations
/// must be cheap to call from the receive path.
pub trait DecodeUnitSink: Send + Sync {
    fn submit_decode_unit(&self, unit: DecodeUnit);
}
