//! Default software implementation of [`CryptoFactory`] using the `aes` and `cmac` crates.
//!
//! This is the same pairing the teacher crate ships behind its `default-crypto` feature; a board
//! with a hardware AES engine or a secure element can implement [`CryptoFactory`] itself and skip
//! this module entirely.
use crate::keys::*;
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::Cmac as CmacImpl;
use cmac::Mac as _;

pub type CmacAes128 = CmacImpl<Aes128>;

/// Default, allocation-free implementation backed by the `aes`/`cmac` crates.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct DefaultFactory;

impl CryptoFactory for DefaultFactory {
    type E = Aes128;
    type D = Aes128;
    type M = CmacAes128;

    fn new_enc(&self, key: &AES128) -> Self::E {
        Aes128::new(GenericArray::from_slice(&key.0))
    }

    fn new_dec(&self, key: &AES128) -> Self::D {
        Aes128::new(GenericArray::from_slice(&key.0))
    }

    fn new_mac(&self, key: &AES128) -> Self::M {
        CmacImpl::new(GenericArray::from_slice(&key.0))
    }
}

impl Encrypter for Aes128 {
    fn encrypt_block(&self, block: &mut [u8; 16]) {
        BlockEncrypt::encrypt_block(self, GenericArray::from_mut_slice(block));
    }
}

impl Decrypter for Aes128 {
    fn decrypt_block(&self, block: &mut [u8; 16]) {
        BlockDecrypt::decrypt_block(self, GenericArray::from_mut_slice(block));
    }
}

impl Cmac for CmacAes128 {
    fn input(&mut self, data: &[u8]) {
        cmac::Mac::update(self, data);
    }

    fn result(self) -> [u8; 16] {
        cmac::Mac::finalize(self).into_bytes().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecb_is_self_inverse_through_encrypt_then_decrypt() {
        let factory = DefaultFactory;
        let key = AES128([0x2b; 16]);
        let mut block = [0x11u8; 16];
        let original = block;
        factory.new_enc(&key).encrypt_block(&mut block);
        assert_ne!(block, original);
        factory.new_dec(&key).decrypt_block(&mut block);
        assert_eq!(block, original);
    }
}
