pub mod template_instance;
pub mod virtual_machine;
