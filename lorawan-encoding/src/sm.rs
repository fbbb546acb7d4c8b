//! [`SecurityModule`]: the boundary behind which raw key material lives.
//!
//! The MAC layer never sees key bytes -- it only ever names a key by [`KeyId`] and asks the
//! module to run a primitive against it. This mirrors the original stack's `ldl_sm` component:
//! a fixed array of root/session keys addressed by an enum tag, with derivation performed by
//! AES-ECB of a single block and authentication by AES-CMAC. [`DefaultSm`] is a software
//! implementation built on the same [`CryptoFactory`] the rest of the crate uses.

use crate::keys::{
    AppKey, AppSKey, CryptoFactory, Decrypter, Encrypter, FNwkSIntKey, JSEncKey, JSIntKey,
    NwkKey, NwkSEncKey, SNwkSIntKey, AES128,
};
use crate::keys::Cmac as CmacTrait;

/// Addresses one of the key slots a [`SecurityModule`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum KeyId {
    FNwkSInt,
    SNwkSInt,
    NwkSEnc,
    Apps,
    JSEnc,
    JSInt,
    App,
    Nwk,
}

/// Abstraction over the component that holds raw key material and performs AES primitives
/// against it. A device with a hardware secure element implements this trait directly instead
/// of using [`DefaultSm`]; the MAC scheduler is generic over any implementation.
pub trait SecurityModule {
    /// Brackets a batch of [`update_session_key`](Self::update_session_key) calls so a hardware
    /// implementation may commit them atomically.
    fn begin_update_session_key(&mut self);
    fn end_update_session_key(&mut self);

    /// Derives `dst` from `root` via one AES-ECB block keyed on `root`, input `iv`, and stores
    /// the result in the `dst` slot.
    fn update_session_key(&mut self, dst: KeyId, root: KeyId, iv: &[u8; 16]);

    /// Computes a CMAC over `hdr` followed by `data`, keyed on `key`, truncated to 32 bits
    /// (low-order 4 bytes of the 16-byte tag, as LoRaWAN's MIC is defined).
    fn mic(&self, key: KeyId, hdr: &[u8], data: &[u8]) -> u32;

    /// Encrypts one 16-byte block in place (ECB, no chaining) -- used only to decrypt Join-Accept.
    fn ecb_decrypt(&self, key: KeyId, block: &mut [u8; 16]);

    /// LoRaWAN's AES-CTR: XORs `data` in place with a keystream generated by re-encrypting `iv`
    /// once per 16-byte block, with the 16-bit counter in `iv[14..16]` incrementing by one per
    /// block from whatever starting value the caller placed there (FRMPayload blocks start at 1,
    /// FOpts encryption uses the single block 0).
    fn ctr(&self, key: KeyId, iv: &[u8; 16], data: &mut [u8]);
}

/// Default software [`SecurityModule`] backed by a [`CryptoFactory`]. Holds every possible
/// session/root key in an 8-slot array the way the original stack's in-memory module does;
/// unused slots (e.g. `JSEnc`/`JSInt` on a 1.0.x-only device) simply stay zeroed and are never
/// read because the MAC never derives or uses them without a 1.1 join.
pub struct DefaultSm<C> {
    factory: C,
    keys: [AES128; 8],
}

impl<C: CryptoFactory> DefaultSm<C> {
    /// Builds a module with its `Nwk` (or, pre-1.1, `App`) root key installed; the remaining
    /// session/Join-Server keys are filled in later by [`SecurityModule::update_session_key`].
    pub fn new(factory: C, app_key: AppKey, nwk_key: NwkKey) -> Self {
        let mut keys = [AES128([0; 16]); 8];
        keys[KeyId::App as usize] = app_key.0;
        keys[KeyId::Nwk as usize] = nwk_key.0;
        Self { factory, keys }
    }

    fn key(&self, id: KeyId) -> &AES128 {
        &self.keys[id as usize]
    }

    pub fn app_skey(&self) -> AppSKey {
        AppSKey(*self.key(KeyId::Apps))
    }

    pub fn f_nwk_s_int_key(&self) -> FNwkSIntKey {
        FNwkSIntKey(*self.key(KeyId::FNwkSInt))
    }

    pub fn s_nwk_s_int_key(&self) -> SNwkSIntKey {
        SNwkSIntKey(*self.key(KeyId::SNwkSInt))
    }

    pub fn nwk_s_enc_key(&self) -> NwkSEncKey {
        NwkSEncKey(*self.key(KeyId::NwkSEnc))
    }

    pub fn js_enc_key(&self) -> JSEncKey {
        JSEncKey(*self.key(KeyId::JSEnc))
    }

    pub fn js_int_key(&self) -> JSIntKey {
        JSIntKey(*self.key(KeyId::JSInt))
    }
}

impl<C: CryptoFactory> SecurityModule for DefaultSm<C> {
    fn begin_update_session_key(&mut self) {}
    fn end_update_session_key(&mut self) {}

    fn update_session_key(&mut self, dst: KeyId, root: KeyId, iv: &[u8; 16]) {
        let mut block = *iv;
        self.factory.new_enc(self.key(root)).encrypt_block(&mut block);
        self.keys[dst as usize] = AES128(block);
    }

    fn mic(&self, key: KeyId, hdr: &[u8], data: &[u8]) -> u32 {
        let mut mac = self.factory.new_mac(self.key(key));
        mac.input(hdr);
        mac.input(data);
        let tag = mac.result();
        u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]])
    }

    fn ecb_decrypt(&self, key: KeyId, block: &mut [u8; 16]) {
        self.factory.new_dec(self.key(key)).decrypt_block(block);
    }

    fn ctr(&self, key: KeyId, iv: &[u8; 16], data: &mut [u8]) {
        let enc = self.factory.new_enc(self.key(key));
        let start = u16::from_be_bytes([iv[14], iv[15]]);
        for (offset, chunk) in data.chunks_mut(16).enumerate() {
            let mut counter_block = *iv;
            let counter = start.wrapping_add(offset as u16);
            counter_block[14] = (counter >> 8) as u8;
            counter_block[15] = counter as u8;
            enc.encrypt_block(&mut counter_block);
            for (b, k) in chunk.iter_mut().zip(counter_block.iter()) {
                *b ^= k;
            }
        }
    }
}

#[cfg(all(test, feature = "default-crypto"))]
mod tests {
    use super::*;
    use crate::default_crypto::DefaultFactory;

    #[test]
    fn update_session_key_is_ecb_of_iv() {
        let mut sm = DefaultSm::new(DefaultFactory, AppKey::from([0x2b; 16]), NwkKey::from([0x2b; 16]));
        let iv = [0u8; 16];
        sm.update_session_key(KeyId::FNwkSInt, KeyId::Nwk, &iv);
        let mut expect = iv;
        DefaultFactory.new_enc(&AES128([0x2b; 16])).encrypt_block(&mut expect);
        assert_eq!(sm.f_nwk_s_int_key().0 .0, expect);
    }

    #[test]
    fn ctr_is_self_inverse() {
        let sm = DefaultSm::new(DefaultFactory, AppKey::from([0x11; 16]), NwkKey::from([0x11; 16]));
        let iv = [0x42u8; 16];
        let mut data = [0xAAu8; 37];
        let original = data;
        sm.ctr(KeyId::App, &iv, &mut data);
        assert_ne!(data, original);
        sm.ctr(KeyId::App, &iv, &mut data);
        assert_eq!(data, original);
    }
}
