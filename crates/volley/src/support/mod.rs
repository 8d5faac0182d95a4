//! Concurrency building blocks shared by the handling strategies.

pub(crate) mod ring;

pub(crate) use ring::RingBuffer;
