#[rocket::launch]
fn launch() -> _ {
    chat_core::rocket()
}
