use crate::memory::PAGE_SIZE;

/// Kernel tunables for the user-program layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Most argv entries a command line may carry.
    pub max_args: usize,
    /// Largest program-header count accepted in an executable header.
    pub max_program_headers: u16,
    /// Longest string copied in from user memory, terminator excluded.
    pub max_user_string: usize,
    /// Longest command line `spawn` will copy, terminator excluded.
    pub max_command_line: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_args: 64,
            max_program_headers: 1024,
            max_user_string: PAGE_SIZE as usize - 1,
            max_command_line: PAGE_SIZE as usize - 1,
        }
    }
}
