use rocket::launch;

#[launch]
fn rocket() -> _ {
	// A missing .env is fine, everything can come from Rocket.toml
	dotenvy::dotenv().ok();

	ota_server::build_rocket(rocket::Config::figment())
}
