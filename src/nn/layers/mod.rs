mod batchnorm;
mod conv;
mod leaky;
mod upsample;

pub use batchnorm::BatchNorm2d;
pub use conv::{Conv2d, Padding};
pub use leaky::LeakyReLU;
pub use upsample::{concat_channels, Upsample2d};
