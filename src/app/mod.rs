// Application layer: the seams between pipeline logic and its adapters

pub mod ports;
