/// Runtime limits for one virtual machine instance.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_stack_size: usize,
    pub gc_threshold: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 128,
            max_stack_size: 2048,
            gc_threshold: 1024,
        }
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }
}
