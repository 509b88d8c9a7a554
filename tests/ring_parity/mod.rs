pub mod helpers;

pub mod autograd;
pub mod head_window;
pub mod rotating;
