use divan::black_box;
use rand::RngCore;
use turnstile_crypto::{cookie_key, CookieSecret, Cookie, EncryptedCookie, Mac, NONCE_LEN};

fn main() {
    divan::main();
}

#[divan::bench]
fn derive(bencher: divan::Bencher) {
    let mut secret = CookieSecret::default();
    secret.generate(&mut rand::rngs::OsRng);
    let addr = "192.0.2.1:51820".parse().unwrap();
    bencher.bench(|| black_box(&secret).cookie_for(black_box(addr)));
}

#[divan::bench]
fn seal(bencher: divan::Bencher) {
    let key = cookie_key(&[0x55; 32]);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let mac1: Mac = [0x21; 16];
    bencher.bench(|| {
        EncryptedCookie::seal(black_box(Cookie([0x33; 16])), &key, &nonce, &mac1)
    });
}

#[divan::bench]
fn open(bencher: divan::Bencher) {
    let key = cookie_key(&[0x55; 32]);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let mac1: Mac = [0x21; 16];
    let sealed = EncryptedCookie::seal(Cookie([0x33; 16]), &key, &nonce, &mac1);
    bencher.bench(|| {
        let mut sealed = black_box(sealed);
        sealed.open(&key, &nonce, &mac1).is_ok()
    });
}
