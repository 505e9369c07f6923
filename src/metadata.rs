pub mod bencode;
pub mod descriptor;
