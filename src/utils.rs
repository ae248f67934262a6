//! Identifier and digest helpers

use bech32::Bech32m;
use std::thread;
use uuid7::uuid7;

/// Human-readable prefix of response correlation ids.
pub const CORRELATION_HRP: &str = "reqi";

// construct a unique time-ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Token identifying one fulfillment line of one movement, recorded on the item it touched.
pub fn fulfillment_token(kind: &str, movement: &str, item: &str) -> String {
    sha256::digest(format!("{kind}|{movement}|{item}"))
}

/// Run `f` over `inputs` on scoped threads, `batch_size` at a time, keeping input order.
/// Each batch is joined before the next starts.
pub fn in_bounded_batches<T, R, F>(inputs: &[T], batch_size: usize, f: F) -> Vec<anyhow::Result<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> anyhow::Result<R> + Sync,
{
    let f = &f;
    let mut results = Vec::with_capacity(inputs.len());

    for batch in inputs.chunks(batch_size.max(1)) {
        thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .map(|input| scope.spawn(move || f(input)))
                .collect();
            for handle in handles {
                results.push(
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("batch worker panicked"))),
                );
            }
        });
    }
    results
}
