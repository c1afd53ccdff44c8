mod block_download;
mod handshake;
mod serving;
mod util;
