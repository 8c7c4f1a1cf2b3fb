/// Exponentially growing, capped, jittered delay between attempts.
pub mod exponential;
