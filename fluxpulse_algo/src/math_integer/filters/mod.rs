pub mod lpf;

pub use lpf::FilterLPF;
