pub(crate) mod frame_io;
