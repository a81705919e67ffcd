#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The arena could not grow enough to satisfy the request.
    HeapExhausted,
    /// The requested payload does not fit the 29-bit size field.
    RequestTooLarge,
}
